//! Interpreter resolution.

use serde::{Deserialize, Serialize};

use crate::block::Language;

/// Per-vault interpreter overrides. Unset entries fall back to the defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterpreterSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ruby: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
}

impl InterpreterSettings {
    /// Default interpreter command for an executable language.
    pub fn default_for(language: Language) -> Option<&'static str> {
        match language {
            Language::Shell => Some("bash"),
            Language::Python => Some("python3"),
            Language::Ruby => Some("ruby"),
            Language::JavaScript => Some("node"),
            _ => None,
        }
    }

    /// Configured override for a language, if any.
    pub fn configured(&self, language: Language) -> Option<&str> {
        let value = match language {
            Language::Shell => self.shell.as_deref(),
            Language::Python => self.python.as_deref(),
            Language::Ruby => self.ruby.as_deref(),
            Language::JavaScript => self.node.as_deref(),
            _ => None,
        };
        value.filter(|s| !s.trim().is_empty())
    }

    /// Interpreter to use: the override, else the default.
    pub fn resolve(&self, language: Language) -> Option<String> {
        self.configured(language)
            .or_else(|| Self::default_for(language))
            .map(str::to_string)
    }

    /// Flag that makes the interpreter run the following argument as code.
    pub fn script_flag(language: Language) -> Option<&'static str> {
        match language {
            Language::Shell | Language::Python => Some("-c"),
            Language::Ruby | Language::JavaScript => Some("-e"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = InterpreterSettings::default();
        assert_eq!(settings.resolve(Language::Python).as_deref(), Some("python3"));
        assert_eq!(settings.resolve(Language::Shell).as_deref(), Some("bash"));
        assert_eq!(settings.resolve(Language::Rust), None);
    }

    #[test]
    fn test_override_wins_unless_blank() {
        let settings = InterpreterSettings {
            python: Some("/opt/py/bin/python".to_string()),
            ruby: Some("  ".to_string()),
            ..Default::default()
        };
        assert_eq!(
            settings.resolve(Language::Python).as_deref(),
            Some("/opt/py/bin/python")
        );
        assert_eq!(settings.resolve(Language::Ruby).as_deref(), Some("ruby"));
    }

    #[test]
    fn test_script_flags() {
        assert_eq!(InterpreterSettings::script_flag(Language::Shell), Some("-c"));
        assert_eq!(InterpreterSettings::script_flag(Language::Ruby), Some("-e"));
        assert_eq!(InterpreterSettings::script_flag(Language::JavaScript), Some("-e"));
        assert_eq!(InterpreterSettings::script_flag(Language::Sql), None);
    }
}
