use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Generation backends the proxy can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    #[serde(rename = "kobold")]
    Kobold,
    #[serde(rename = "koboldcpp")]
    KoboldCpp,
    #[serde(rename = "ooba")]
    Ooba,
    #[serde(rename = "llama.cpp")]
    LlamaCpp,
    #[serde(rename = "llama-cpp-python")]
    LlamaCppPython,
    #[serde(rename = "horde")]
    Horde,
}

impl BackendKind {
    pub const ALL: [BackendKind; 6] = [
        BackendKind::Kobold,
        BackendKind::KoboldCpp,
        BackendKind::Ooba,
        BackendKind::LlamaCpp,
        BackendKind::LlamaCppPython,
        BackendKind::Horde,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Kobold => "kobold",
            BackendKind::KoboldCpp => "koboldcpp",
            BackendKind::Ooba => "ooba",
            BackendKind::LlamaCpp => "llama.cpp",
            BackendKind::LlamaCppPython => "llama-cpp-python",
            BackendKind::Horde => "horde",
        }
    }

    /// Whether the backend cuts its own output at the requested stop strings.
    /// Every other backend needs the proxy to scan the text itself.
    pub fn truncates_natively(&self) -> bool {
        matches!(self, BackendKind::LlamaCpp | BackendKind::LlamaCppPython)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        BackendKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| {
                format!(
                    "unknown backend '{}', expected one of: kobold, koboldcpp, ooba, llama.cpp, llama-cpp-python, horde",
                    value
                )
            })
    }
}
