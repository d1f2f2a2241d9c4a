// CLI commands for running code locally
use anyhow::{Context, Result};
use codepad_common::config::ServiceConfig;
use codepad_engine::{
    Coordinator, ExecutionLimits, ExecutionRequest, ExecutionResult, LanguageRegistry,
    WorkspaceManager,
};
use std::ffi::OsStr;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Exit status reported when the program ran out of time, matching coreutils `timeout`
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Execute a source file and mirror the program's output and exit status
pub async fn run_file(
    config: &ServiceConfig,
    language: &str,
    file: &Path,
    stdin: Option<&Path>,
    json: bool,
) -> Result<i32> {
    let registry = LanguageRegistry::load(config.languages_file.as_deref())?;
    debug!(language, file = %file.display(), "Running file");

    let source = fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let mut request = ExecutionRequest::new(language, source);
    if let Some(path) = stdin {
        let input = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        request = request.with_stdin(input);
    }

    // The API server may share this root, so never purge it from here
    let workspaces = WorkspaceManager::new(&config.workspace_root);
    workspaces
        .prepare_root()
        .await
        .context("Failed to prepare workspace root")?;
    let coordinator = Coordinator::new(
        Arc::new(registry),
        workspaces,
        ExecutionLimits::from(config),
        &config.env_passthrough,
    );

    let report = coordinator
        .execute(request)
        .await
        .map_err(|e| anyhow::anyhow!(e.public_message()))?;

    if json {
        let body = serde_json::to_string_pretty(&report.to_response())
            .context("Failed to serialize response")?;
        println!("{}", body);
    } else if let Some(result) = report.final_result() {
        io::stdout().write_all(&result.stdout)?;
        io::stdout().flush()?;
        io::stderr().write_all(&result.stderr)?;
        if result.stdout_truncated || result.stderr_truncated {
            eprintln!("⚠️  Output truncated at {} bytes", config.max_output_bytes);
        }
        if result.timed_out {
            eprintln!("⏱️  {} timed out after {} ms", result.phase, result.duration_ms);
        }
    }

    Ok(report.final_result().map_or(1, exit_code_for))
}

/// List every language the registry knows
pub fn list_languages(config: &ServiceConfig, json: bool) -> Result<i32> {
    let registry = LanguageRegistry::load(config.languages_file.as_deref())?;

    if json {
        let infos: Vec<_> = registry.languages().map(|l| l.info()).collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&infos).context("Failed to serialize languages")?
        );
        return Ok(0);
    }

    println!("{:<12} {:<12} {:<10} {:<9} ALIASES", "ID", "NAME", "EXTENSION", "COMPILED");
    for language in registry.languages() {
        println!(
            "{:<12} {:<12} {:<10} {:<9} {}",
            language.id,
            language.name,
            language.file_extension,
            if language.is_compiled() { "yes" } else { "no" },
            language.aliases.join(", ")
        );
    }
    Ok(0)
}

/// Report whether each language's compiler and runtime can be found on PATH
pub fn doctor(config: &ServiceConfig) -> Result<i32> {
    let registry = LanguageRegistry::load(config.languages_file.as_deref())?;
    let path_var = std::env::var_os("PATH");

    println!("🩺 Checking {} languages", registry.languages().count());

    let mut missing = 0;
    for language in registry.languages() {
        let programs = language
            .compile
            .iter()
            .chain(std::iter::once(&language.run))
            .map(|template| template.program.as_str())
            // Placeholders point at build output that only exists during a request
            .filter(|program| !program.starts_with('{'));

        for program in programs {
            match find_program(program, path_var.as_deref()) {
                Some(found) => println!("  ✅ {:<12} {} -> {}", language.id, program, found.display()),
                None => {
                    missing += 1;
                    println!("  ❌ {:<12} {} not found", language.id, program);
                }
            }
        }
    }

    if missing == 0 {
        println!("✨ All toolchains available");
        Ok(0)
    } else {
        println!("⚠️  {} program(s) missing", missing);
        Ok(1)
    }
}

/// Process exit status that mirrors a finished phase
pub fn exit_code_for(result: &ExecutionResult) -> i32 {
    if result.timed_out {
        return TIMEOUT_EXIT_CODE;
    }
    match (result.exit_code, result.signal) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

/// Resolve a program the way the runner will: paths are taken as-is, bare
/// names are searched for in PATH.
pub fn find_program(program: &str, path_var: Option<&OsStr>) -> Option<PathBuf> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    which::which_in(program, path_var, cwd).ok()
}
