// Language registry
// Loads and validates languages from languages.json, or falls back to the built-in table

use crate::error::ExecutionError;
use anyhow::{Context, Result, bail};
use codepad_common::types::LanguageInfo;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;

const PLACEHOLDER_SOURCE: &str = "{source}";
const PLACEHOLDER_ARTIFACT: &str = "{artifact}";
const PLACEHOLDER_WORKSPACE: &str = "{workspace}";

/// Program plus argument list. `{source}`, `{artifact}` and `{workspace}` are
/// replaced with absolute paths inside the request's workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn mentions(&self, placeholder: &str) -> bool {
        self.program.contains(placeholder) || self.args.iter().any(|a| a.contains(placeholder))
    }
}

fn default_stem() -> String {
    "main".to_string()
}

/// How to turn a source file of one language into a running process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageDescriptor {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub file_extension: String,
    /// File name without extension. Java needs `Main` to match the public class.
    #[serde(default = "default_stem")]
    pub source_stem: String,
    pub run: CommandTemplate,
    #[serde(default)]
    pub compile: Option<CommandTemplate>,
    /// File name of the compiled output, relative to the workspace.
    #[serde(default)]
    pub artifact: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl LanguageDescriptor {
    pub fn source_file_name(&self) -> String {
        format!("{}.{}", self.source_stem, self.file_extension)
    }

    pub fn is_compiled(&self) -> bool {
        self.compile.is_some()
    }

    pub fn info(&self) -> LanguageInfo {
        LanguageInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            aliases: self.aliases.clone(),
            extension: self.file_extension.clone(),
            compiled: self.is_compiled(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            bail!("Language id must not be empty");
        }
        for (field, value) in [
            ("file_extension", &self.file_extension),
            ("source_stem", &self.source_stem),
        ] {
            if value.is_empty() || value.contains(&['/', '\\'][..]) || value.starts_with('.') {
                bail!("Language '{}' has an invalid {}: '{}'", self.id, field, value);
            }
        }
        if self.run.program.trim().is_empty() {
            bail!("Language '{}' has an empty run command", self.id);
        }
        let uses_artifact = self.run.mentions(PLACEHOLDER_ARTIFACT)
            || self
                .compile
                .as_ref()
                .is_some_and(|c| c.mentions(PLACEHOLDER_ARTIFACT));
        match &self.artifact {
            None if uses_artifact => {
                bail!("Language '{}' uses {} but declares no artifact", self.id, PLACEHOLDER_ARTIFACT)
            }
            Some(artifact) if artifact.is_empty() || artifact.contains(&['/', '\\'][..]) => {
                bail!("Language '{}' has an invalid artifact name: '{}'", self.id, artifact)
            }
            _ => {}
        }
        if self.compile.is_none() && !self.run.mentions(PLACEHOLDER_SOURCE) {
            bail!(
                "Language '{}' is interpreted but its run command never references {}",
                self.id,
                PLACEHOLDER_SOURCE
            );
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageDescriptor>,
}

/// Immutable lookup table shared by every request.
///
/// Built once at startup and handed around as `Arc<LanguageRegistry>`; there is
/// no interior mutability, so concurrent lookups need no locking.
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    languages: Vec<Arc<LanguageDescriptor>>,
    index: HashMap<String, usize>,
}

impl LanguageRegistry {
    /// Build a registry from descriptors, rejecting duplicates and malformed entries
    pub fn from_descriptors(descriptors: Vec<LanguageDescriptor>) -> Result<Self> {
        if descriptors.is_empty() {
            bail!("No languages configured");
        }

        let mut languages = Vec::with_capacity(descriptors.len());
        let mut index = HashMap::new();

        for descriptor in descriptors {
            descriptor.validate()?;
            let slot = languages.len();
            let keys = std::iter::once(&descriptor.id).chain(descriptor.aliases.iter());
            for key in keys {
                let key = normalize(key);
                if let Some(&existing) = index.get(&key) {
                    let other: &Arc<LanguageDescriptor> = &languages[existing];
                    bail!(
                        "Language key '{}' is claimed by both '{}' and '{}'",
                        key,
                        other.id,
                        descriptor.id
                    );
                }
                index.insert(key, slot);
            }
            languages.push(Arc::new(descriptor));
        }

        Ok(Self { languages, index })
    }

    /// Load language configuration from a languages.json file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            bail!("Language config file not found: {}", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let languages_json: LanguagesJson = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        Self::from_descriptors(languages_json.languages)
            .with_context(|| format!("Invalid language configuration in {}", path.display()))
    }

    /// Load from `path` when given, otherwise use the built-in table
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => Ok(Self::builtin()),
        }
    }

    /// The runtimes supported out of the box
    pub fn builtin() -> Self {
        Self::from_descriptors(builtin_descriptors())
            .unwrap_or_else(|e| unreachable!("built-in language table is invalid: {e}"))
    }

    /// Resolve a language id or alias (case-insensitive)
    pub fn lookup(&self, language: &str) -> Result<Arc<LanguageDescriptor>, ExecutionError> {
        self.index
            .get(&normalize(language))
            .map(|&slot| Arc::clone(&self.languages[slot]))
            .ok_or_else(|| ExecutionError::UnsupportedLanguage(language.to_string()))
    }

    /// All descriptors in declaration order
    pub fn languages(&self) -> impl Iterator<Item = &LanguageDescriptor> {
        self.languages.iter().map(|d| d.as_ref())
    }

    pub fn list_languages(&self) -> Vec<String> {
        self.languages.iter().map(|d| d.id.clone()).collect()
    }
}

fn normalize(key: &str) -> String {
    key.trim().to_lowercase()
}

fn builtin_descriptors() -> Vec<LanguageDescriptor> {
    vec![
        LanguageDescriptor {
            id: "python".into(),
            name: "Python".into(),
            aliases: vec!["py".into(), "python3".into()],
            file_extension: "py".into(),
            source_stem: default_stem(),
            run: CommandTemplate::new("python3", &["-u", PLACEHOLDER_SOURCE]),
            compile: None,
            artifact: None,
            env: BTreeMap::from([("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string())]),
        },
        LanguageDescriptor {
            id: "javascript".into(),
            name: "JavaScript".into(),
            aliases: vec!["js".into(), "node".into()],
            file_extension: "js".into(),
            source_stem: default_stem(),
            run: CommandTemplate::new("node", &[PLACEHOLDER_SOURCE]),
            compile: None,
            artifact: None,
            env: BTreeMap::new(),
        },
        LanguageDescriptor {
            id: "c".into(),
            name: "C".into(),
            aliases: vec![],
            file_extension: "c".into(),
            source_stem: default_stem(),
            run: CommandTemplate::new(PLACEHOLDER_ARTIFACT, &[]),
            compile: Some(CommandTemplate::new(
                "gcc",
                &["-O2", "-o", PLACEHOLDER_ARTIFACT, PLACEHOLDER_SOURCE, "-lm"],
            )),
            artifact: Some("main".into()),
            env: BTreeMap::new(),
        },
        LanguageDescriptor {
            id: "cpp".into(),
            name: "C++".into(),
            aliases: vec!["c++".into()],
            file_extension: "cpp".into(),
            source_stem: default_stem(),
            run: CommandTemplate::new(PLACEHOLDER_ARTIFACT, &[]),
            compile: Some(CommandTemplate::new(
                "g++",
                &["-O2", "-std=c++17", "-o", PLACEHOLDER_ARTIFACT, PLACEHOLDER_SOURCE],
            )),
            artifact: Some("main".into()),
            env: BTreeMap::new(),
        },
        LanguageDescriptor {
            id: "java".into(),
            name: "Java".into(),
            aliases: vec![],
            file_extension: "java".into(),
            source_stem: "Main".into(),
            run: CommandTemplate::new("java", &["-cp", PLACEHOLDER_WORKSPACE, "Main"]),
            compile: Some(CommandTemplate::new(
                "javac",
                &["-d", PLACEHOLDER_WORKSPACE, PLACEHOLDER_SOURCE],
            )),
            artifact: None,
            env: BTreeMap::new(),
        },
    ]
}

/// Substitute workspace paths into a command template
pub(crate) fn render(template: &CommandTemplate, source: &Path, artifact: Option<&Path>, workspace: &Path) -> (String, Vec<String>) {
    let fill = |s: &str| {
        let mut out = s
            .replace(PLACEHOLDER_SOURCE, &source.to_string_lossy())
            .replace(PLACEHOLDER_WORKSPACE, &workspace.to_string_lossy());
        if let Some(artifact) = artifact {
            out = out.replace(PLACEHOLDER_ARTIFACT, &artifact.to_string_lossy());
        }
        out
    };
    (
        fill(template.program.as_str()),
        template.args.iter().map(|a| fill(a.as_str())).collect(),
    )
}
