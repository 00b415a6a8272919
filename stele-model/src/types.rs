//! Strong types for byte arrays
//!
//! Semantic newtypes for the protocol's fixed-size identifiers, replacing
//! raw `[u8; N]`.

use std::fmt;

use uuid::Uuid;

/// Macro to define fixed-size byte arrays with strong types.
///
/// Args:
/// - $name: The name of the struct (e.g., System)
/// - $len: The size of the array (e.g., 32)
/// - $doc: Documentation string
/// - $derives: List of traits to derive
macro_rules! define_bytes {
    ($name:ident, $len:expr, $doc:expr, [$($derives:ident),*]) => {
        #[doc = $doc]
        #[derive(Clone, Copy, $($derives),*)]
        #[repr(transparent)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            /// Returns the inner bytes as a slice.
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            /// Parse from a hex string.
            pub fn from_hex(hex_str: &str) -> Result<Self, String> {
                let bytes = hex::decode(hex_str)
                    .map_err(|e| format!("invalid hex: {}", e))?;
                if bytes.len() != $len {
                    return Err(format!(
                        "expected {} hex characters, got {}",
                        $len * 2,
                        hex_str.len()
                    ));
                }
                Ok(Self(bytes.try_into().map_err(|_| "internal error: length mismatch".to_string())?))
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl From<$name> for [u8; $len] {
            fn from(wrapper: $name) -> [u8; $len] {
                wrapper.0
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = [u8; $len];
            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        // Zero-allocation hex formatting
        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(self, f)
            }
        }

        impl fmt::LowerHex for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for byte in &self.0 {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}(", stringify!($name))?;
                fmt::Display::fmt(self, f)?;
                write!(f, ")")
            }
        }

        impl TryFrom<&[u8]> for $name {
            type Error = std::array::TryFromSliceError;
            fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
                Ok(Self(<[u8; $len]>::try_from(slice)?))
            }
        }

        impl TryFrom<Vec<u8>> for $name {
            type Error = Vec<u8>;
            fn try_from(vec: Vec<u8>) -> Result<Self, Self::Error> {
                if vec.len() != $len {
                    return Err(vec);
                }
                let mut arr = [0u8; $len];
                arr.copy_from_slice(&vec);
                Ok(Self(arr))
            }
        }
    };
}

define_bytes!(
    System,
    32,
    "An account identity: a 32-byte Ed25519 public key, stable across devices.",
    [PartialEq, Eq, Hash, PartialOrd, Ord]
);

define_bytes!(
    Digest,
    32,
    "A 32-byte blake3 content address of an event's canonical bytes.",
    [PartialEq, Eq, Hash, PartialOrd, Ord]
);

define_bytes!(
    Signature,
    64,
    "A 64-byte Ed25519 signature over an event's canonical bytes.",
    [PartialEq, Eq]
);

/// One device/writer's log identity within a system: a 16-byte random id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Process(Uuid);

impl Process {
    /// Generate a fresh random process id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the inner bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl From<[u8; 16]> for Process {
    fn from(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }
}

impl TryFrom<&[u8]> for Process {
    type Error = std::array::TryFromSliceError;
    fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
        Ok(Self(Uuid::from_bytes(<[u8; 16]>::try_from(slice)?)))
    }
}

impl AsRef<[u8]> for Process {
    fn as_ref(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0.as_bytes()))
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Process({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_hex_round_trip() {
        let system = System::from([7u8; 32]);
        let parsed = System::from_hex(&format!("{}", system)).unwrap();
        assert_eq!(system, parsed);
    }

    #[test]
    fn test_system_from_hex_rejects_wrong_length() {
        assert!(System::from_hex("abcd").is_err());
    }

    #[test]
    fn test_process_random_is_unique() {
        assert_ne!(Process::random(), Process::random());
    }

    #[test]
    fn test_process_byte_round_trip() {
        let process = Process::random();
        let bytes = *process.as_bytes();
        assert_eq!(process, Process::from(bytes));
    }
}
