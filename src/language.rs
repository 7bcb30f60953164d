use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    En,
    De,
    Fr,
    It,
    Es,
    Ja,
}

impl Language {
    pub const ALL: [Self; 6] = [Self::En, Self::De, Self::Fr, Self::It, Self::Es, Self::Ja];

    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::En => "en",
            Self::De => "de",
            Self::Fr => "fr",
            Self::It => "it",
            Self::Es => "es",
            Self::Ja => "ja",
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::En => "english",
            Self::De => "german",
            Self::Fr => "french",
            Self::It => "italian",
            Self::Es => "spanish",
            Self::Ja => "japanese",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Accepts a language code or its English name, case-insensitively
impl FromStr for Language {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|lang| lang.code() == needle || lang.name() == needle)
            .ok_or_else(|| Error::InvalidRequest(format!("Unknown language {s:?}")))
    }
}
