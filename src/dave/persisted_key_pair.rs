// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Loading and storing the MLS signature key pair.
//!
//! Reusing the same signature key across reconnects of one auth session is
//! what makes user verification codes stable, so the pair is persisted on
//! disk keyed by the session id. Without a session id a transient in-memory
//! pair is generated instead.

use std::fs;
use std::path::PathBuf;

use log::*;
use openmls::prelude::SignatureScheme;
use openmls_basic_credential::SignatureKeyPair;

use crate::errors::DaveError;

const KEY_VERSION: u8 = 1;

/// Resolves the key storage directory under the user's config directory.
fn key_storage_directory() -> Option<PathBuf> {
    let mut dir = if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(xdg)
    } else if let Some(home) = std::env::var_os("HOME") {
        let mut home = PathBuf::from(home);
        home.push(".config");
        home
    } else {
        return None;
    };

    dir.push("descant");
    dir.push("key-storage");
    Some(dir)
}

/// Generates a signature key pair that only lives for this process.
pub fn transient_key_pair(scheme: SignatureScheme) -> Result<SignatureKeyPair, DaveError> {
    SignatureKeyPair::new(scheme).map_err(|e| DaveError::KeyStorage {
        reason: format!("failed to generate signature key pair: {e:?}"),
    })
}

/// Loads the signature key pair persisted for `session_id`, generating and
/// storing a fresh one on first use.
///
/// The file is written to a temporary path and atomically renamed into
/// place, so a crash can never leave a truncated key behind.
pub fn get_persisted_key_pair(
    session_id: &str,
    scheme: SignatureScheme,
) -> Result<SignatureKeyPair, DaveError> {
    let Some(dir) = key_storage_directory() else {
        return Err(DaveError::KeyStorage {
            reason: "could not determine a key storage directory".to_string(),
        });
    };

    fs::create_dir_all(&dir).map_err(|e| DaveError::KeyStorage {
        reason: format!("failed to create key storage directory: {e}"),
    })?;

    let file = dir.join(format!(
        "{session_id}-{:04x}-{KEY_VERSION}.key",
        scheme as u16
    ));

    if file.exists() {
        let contents = fs::read(&file).map_err(|e| DaveError::KeyStorage {
            reason: format!("failed to read key file: {e}"),
        })?;

        match serde_json::from_slice::<SignatureKeyPair>(&contents) {
            Ok(pair) => {
                debug!("DAVE: Loaded persisted signature key pair for session {session_id}");
                return Ok(pair);
            }
            Err(e) => {
                warn!("DAVE: Failed to parse persisted key pair, generating a new one: {e}");
            }
        }
    }

    let pair = transient_key_pair(scheme)?;

    let serialized = serde_json::to_vec(&pair).map_err(|e| DaveError::KeyStorage {
        reason: format!("failed to serialize key pair: {e}"),
    })?;

    let tmp_file = file.with_extension("key.tmp");
    fs::write(&tmp_file, serialized).map_err(|e| DaveError::KeyStorage {
        reason: format!("failed to write key file: {e}"),
    })?;
    fs::rename(&tmp_file, &file).map_err(|e| DaveError::KeyStorage {
        reason: format!("failed to move key file into place: {e}"),
    })?;

    debug!("DAVE: Generated and persisted a signature key pair for session {session_id}");
    Ok(pair)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persisted_pair_is_stable() {
        let tmp = std::env::temp_dir().join(format!("descant-keys-{}", std::process::id()));
        std::env::set_var("XDG_CONFIG_HOME", &tmp);

        let scheme = SignatureScheme::ECDSA_SECP256R1_SHA256;
        let first = get_persisted_key_pair("session-abc", scheme).unwrap();
        let second = get_persisted_key_pair("session-abc", scheme).unwrap();
        assert_eq!(first.public(), second.public());

        let other = get_persisted_key_pair("session-xyz", scheme).unwrap();
        assert_ne!(first.public(), other.public());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn transient_pairs_are_unique() {
        let scheme = SignatureScheme::ECDSA_SECP256R1_SHA256;
        let one = transient_key_pair(scheme).unwrap();
        let two = transient_key_pair(scheme).unwrap();
        assert_ne!(one.public(), two.public());
    }
}
