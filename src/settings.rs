//! Bitfield-encoded server, channel and per-user settings.
//!
//! Each settings type is a fixed enum of named flags; bit values are powers
//! of two assigned from declaration order, so the stored integers stay
//! stable as long as new flags are only appended.

use crate::error::UnknownFlag;

/// A named flag within one settings type.
pub trait SettingsFlag: Copy {
    fn bit(self) -> u64;
    fn name(self) -> &'static str;
}

macro_rules! settings_flags {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($variant:ident => $flag_name:literal,)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        $vis enum $name {
            $($variant,)*
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),*];

            /// Resolves a stored flag name. Unknown names are a bug in the
            /// caller, never treated as an unset flag.
            pub fn from_name(name: &str) -> Result<Self, UnknownFlag> {
                match name {
                    $($flag_name => Ok($name::$variant),)*
                    _ => Err(UnknownFlag(name.to_string())),
                }
            }
        }

        impl SettingsFlag for $name {
            fn bit(self) -> u64 {
                1u64 << (self as u64)
            }

            fn name(self) -> &'static str {
                match self {
                    $($name::$variant => $flag_name,)*
                }
            }
        }
    };
}

settings_flags! {
    /// Per-server behavior flags.
    pub enum ServerFlag {
        ReadTheRulesConsentEnabled => "readTheRulesConsentEnabled",
        ConsiderAllMessagesPublic => "considerAllMessagesPublic",
        AnonymizeMessages => "anonymizeMessages",
    }
}

settings_flags! {
    /// Per-channel behavior flags. Indexing is opt-in per channel.
    pub enum ChannelFlag {
        IndexingEnabled => "indexingEnabled",
        AutoThreadEnabled => "autoThreadEnabled",
        MarkSolutionEnabled => "markSolutionEnabled",
        SendMarkSolutionInstructionsInNewThreads => "sendMarkSolutionInstructionsInNewThreads",
        ForumGuidelinesConsentEnabled => "forumGuidelinesConsentEnabled",
    }
}

settings_flags! {
    /// Per-user, per-server consent flags.
    pub enum UserServerFlag {
        CanPubliclyDisplayMessages => "canPubliclyDisplayMessages",
        MessageIndexingDisabled => "messageIndexingDisabled",
    }
}

/// A raw settings value. The flag type it pairs with is tracked by the
/// caller; storage only sees the integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Bitfield(pub u64);

impl Bitfield {
    pub fn from_flags<F: SettingsFlag>(flags: &[F]) -> Self {
        flags.iter().fold(Bitfield(0), |acc, f| acc.set(*f))
    }

    pub fn has<F: SettingsFlag>(self, flag: F) -> bool {
        self.0 & flag.bit() != 0
    }

    #[must_use]
    pub fn set<F: SettingsFlag>(self, flag: F) -> Self {
        Bitfield(self.0 | flag.bit())
    }

    #[must_use]
    pub fn clear<F: SettingsFlag>(self, flag: F) -> Self {
        Bitfield(self.0 & !flag.bit())
    }

    /// Union of set bits. A bit set in either snapshot stays set; merging a
    /// stale snapshot can never un-set consent. Clearing is only ever done
    /// through [`Bitfield::clear`].
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Bitfield(self.0 | other.0)
    }
}
