//! HL7 acknowledgment codes, classes, and wait categories.

use std::fmt;

/// An MSA-1 acknowledgment code.
///
/// Commit-level codes (`CA`/`CE`/`CR`) acknowledge receipt of the message;
/// application-level codes (`AA`/`AE`/`AR`) report the outcome of
/// processing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckCode {
    /// Application Accept
    AA,
    /// Application Error
    AE,
    /// Application Reject
    AR,
    /// Commit Accept
    CA,
    /// Commit Error
    CE,
    /// Commit Reject
    CR,
}

impl AckCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckCode::AA => "AA",
            AckCode::AE => "AE",
            AckCode::AR => "AR",
            AckCode::CA => "CA",
            AckCode::CE => "CE",
            AckCode::CR => "CR",
        }
    }

    pub fn class(&self) -> AckClass {
        match self {
            AckCode::AA | AckCode::AE | AckCode::AR => AckClass::Application,
            AckCode::CA | AckCode::CE | AckCode::CR => AckClass::Commit,
        }
    }
}

impl fmt::Display for AckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The class of an acknowledgment, derived from the single-letter prefix of
/// the MSA-1 code: `C…` is commit-level, `A…` is application-level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckClass {
    Commit,
    Application,
}

impl AckClass {
    /// Classify a raw MSA-1 code. Unknown prefixes return `None`.
    pub fn from_code(code: &str) -> Option<AckClass> {
        match code.chars().next() {
            Some('C') | Some('c') => Some(AckClass::Commit),
            Some('A') | Some('a') => Some(AckClass::Application),
            _ => None,
        }
    }
}

/// Which acknowledgment a `send_and_wait` caller is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckCategory {
    /// Resolve on the first ack of either class.
    #[default]
    Any,
    /// Resolve only on a commit-level ack.
    Commit,
    /// Resolve only on an application-level ack.
    Application,
}

impl AckCategory {
    /// Whether an ack of the given class satisfies this category.
    pub fn accepts(&self, class: AckClass) -> bool {
        match self {
            AckCategory::Any => true,
            AckCategory::Commit => class == AckClass::Commit,
            AckCategory::Application => class == AckClass::Application,
        }
    }
}
