use std::fmt;
use std::str::FromStr;

/// Languages the translator accepts, keyed by their two-letter code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LanguageCode {
    En,
    De,
    Fr,
    It,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid language code: {0:?} (expected one of EN, DE, FR, IT)")]
pub(crate) struct InvalidLanguage(pub(crate) String);

impl LanguageCode {
    pub(crate) fn code(self) -> &'static str {
        match self {
            Self::En => "EN",
            Self::De => "DE",
            Self::Fr => "FR",
            Self::It => "IT",
        }
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            Self::En => "English",
            Self::De => "German",
            Self::Fr => "French",
            Self::It => "Italian",
        }
    }
}

impl FromStr for LanguageCode {
    type Err = InvalidLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "EN" => Ok(Self::En),
            "DE" => Ok(Self::De),
            "FR" => Ok(Self::Fr),
            "IT" => Ok(Self::It),
            _ => Err(InvalidLanguage(s.to_string())),
        }
    }
}

impl fmt::Display for LanguageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}
