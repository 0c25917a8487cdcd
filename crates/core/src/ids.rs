#![forbid(unsafe_code)]

use serde::{Deserialize, Deserializer, Serialize};

const MAX_ID_LEN: usize = 128;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IdError {
    Empty,
    TooLong,
    InvalidFirstChar,
    InvalidChar { ch: char, index: usize },
}

impl IdError {
    pub fn message(&self) -> String {
        match self {
            Self::Empty => "id must not be empty".to_string(),
            Self::TooLong => format!("id must be at most {MAX_ID_LEN} chars"),
            Self::InvalidFirstChar => "id must start with an ASCII letter or digit".to_string(),
            Self::InvalidChar { ch, index } => {
                format!("id contains invalid char {ch:?} at index {index}")
            }
        }
    }
}

impl std::fmt::Display for IdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message())
    }
}

impl std::error::Error for IdError {}

fn validate_id(value: &str, extra: &[char]) -> Result<(), IdError> {
    if value.is_empty() {
        return Err(IdError::Empty);
    }
    if value.len() > MAX_ID_LEN {
        return Err(IdError::TooLong);
    }
    let mut chars = value.chars();
    let Some(first) = chars.next() else {
        return Err(IdError::Empty);
    };
    if !first.is_ascii_alphanumeric() {
        return Err(IdError::InvalidFirstChar);
    }
    for (index, ch) in value.chars().enumerate().skip(1) {
        if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '/' | '-') {
            continue;
        }
        if extra.contains(&ch) {
            continue;
        }
        return Err(IdError::InvalidChar { ch, index });
    }
    Ok(())
}

macro_rules! validated_id {
    ($name:ident, $extra:expr) => {
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn try_new(value: impl Into<String>) -> Result<Self, IdError> {
                let value = value.into();
                validate_id(&value, $extra)?;
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                Self::try_new(raw).map_err(|err| serde::de::Error::custom(err.message()))
            }
        }
    };
}

validated_id!(WorkType, &[]);
validated_id!(ValidatorName, &[]);
// Changeset ids often embed refs like `pr#42` or `branch:feature/x`.
validated_id!(ChangesetId, &[':', '#']);
