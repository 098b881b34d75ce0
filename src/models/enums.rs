use crate::db::DatabaseError;
use serde::{Deserialize, Serialize};

/// Macro to generate enum with as_str + std::str::FromStr pattern
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $s)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }

            pub fn all() -> &'static [$name] {
                &[$(Self::$variant),+]
            }
        }

        impl std::str::FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(DatabaseError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

// The string values below are persisted in the ledger and read by external
// monitoring tools. Never rename them.

str_enum!(JobState {
    Pending => "pending",
    Fetching => "fetching",
    Rasterizing => "rasterizing",
    Recognizing => "recognizing",
    Completed => "completed",
    Failed => "failed",
    Quarantined => "quarantined",
});

str_enum!(ErrorKind {
    Fetch => "FetchError",
    Rasterize => "RasterizeError",
    Recognition => "RecognitionError",
    Persist => "PersistError",
    Conflict => "ConflictError",
    Config => "ConfigError",
    Interrupted => "Interrupted",
    Internal => "InternalError",
});

str_enum!(OutputFormat {
    Txt => "txt",
    Json => "json",
});

impl JobState {
    /// States a worker holds a job in while it owns the claim.
    pub const IN_FLIGHT: [JobState; 3] = [Self::Fetching, Self::Rasterizing, Self::Recognizing];

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Quarantined)
    }

    pub fn is_in_flight(&self) -> bool {
        Self::IN_FLIGHT.contains(self)
    }

    /// Forward edges of the job lifecycle plus the single retry edge.
    ///
    /// `failed → quarantined` is the operator's manual quarantine of an
    /// exhausted job. Crash/cancel recovery (`in-flight → pending`) is not a
    /// lifecycle edge and goes through the recovery operations instead.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Fetching)
                | (Fetching, Rasterizing)
                | (Rasterizing, Recognizing)
                | (Recognizing, Completed)
                | (Recognizing, Quarantined)
                | (Fetching, Failed)
                | (Rasterizing, Failed)
                | (Recognizing, Failed)
                | (Failed, Pending)
                | (Failed, Quarantined)
        )
    }
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        self.as_str()
    }

    /// Parse a comma-separated format list such as `"txt,json"`.
    pub fn parse_list(s: &str) -> Result<Vec<OutputFormat>, DatabaseError> {
        let mut formats = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let format: OutputFormat = part.parse()?;
            if !formats.contains(&format) {
                formats.push(format);
            }
        }
        Ok(formats)
    }
}
