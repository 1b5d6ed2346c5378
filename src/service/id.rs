//! Unique peer identifiers.

use crate::{Error, Result};
use rand_core::{OsRng, RngCore};

const ID_BYTES: usize = 8;

/// Generates a peer ID from the OS entropy source.
///
/// There is no fallback: when the entropy source is unavailable the caller
/// gets [`Error::Generation`] and must give up on the peer it was creating.
pub fn create_unique_id() -> Result<String> {
    create_unique_id_from(&mut OsRng)
}

pub(crate) fn create_unique_id_from<R: RngCore>(rng: &mut R) -> Result<String> {
    let mut bytes = [0u8; ID_BYTES];
    rng.try_fill_bytes(&mut bytes)
        .map_err(|err| Error::Generation(err.to_string()))?;
    Ok(hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct BrokenRng;

    impl RngCore for BrokenRng {
        fn next_u32(&mut self) -> u32 {
            0
        }

        fn next_u64(&mut self) -> u64 {
            0
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            dest.fill(0);
        }

        fn try_fill_bytes(
            &mut self,
            _dest: &mut [u8],
        ) -> std::result::Result<(), rand_core::Error> {
            Err(rand_core::Error::from(
                std::num::NonZeroU32::new(rand_core::Error::CUSTOM_START).unwrap(),
            ))
        }
    }

    #[test]
    fn ids_are_hex_and_distinct() {
        let ids: HashSet<String> = (0..256).map(|_| create_unique_id().unwrap()).collect();
        assert_eq!(ids.len(), 256);
        for id in &ids {
            assert_eq!(id.len(), ID_BYTES * 2);
            assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn entropy_failure_is_reported() {
        let err = create_unique_id_from(&mut BrokenRng).unwrap_err();
        assert_eq!(err.kind(), "generation");
    }
}
