// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The MLS group session backing a DAVE voice call.
//!
//! This is a thin policy layer over openmls: it owns the group state, turns
//! gateway-delivered proposals into commits and welcomes, verifies welcomes
//! against the expected external sender, and exports the per-user secrets the
//! media key ratchets are seeded with.

use std::collections::{BTreeMap, BTreeSet};

use log::*;
use openmls::prelude::*;
use openmls_basic_credential::SignatureKeyPair;
use openmls_rust_crypto::OpenMlsRustCrypto;
use tls_codec::{Deserialize as TlsDeserialize, Serialize as TlsSerialize};
use zeroize::Zeroizing;

use crate::errors::DaveError;
use crate::types::Snowflake;

use super::ratchet::MlsKeyRatchet;
use super::AES_GCM_128_KEY_BYTES;

/// Export label for per-user media secrets.
const USER_MEDIA_KEY_BASE_LABEL: &str = "Discord Secure Frames v0";

/// Map of user id to public signature key. An empty value means the user was
/// removed from the group.
pub type RosterMap = BTreeMap<u64, Vec<u8>>;

/// Outcome of processing a commit: a hard failure asks the gateway to
/// reinitialize us, a soft failure is ignored.
#[derive(Debug)]
pub enum CommitProcessing {
    Failed,
    Ignored,
    RosterUpdate(RosterMap),
}

fn ciphersuite() -> Ciphersuite {
    Ciphersuite::MLS_128_DHKEMP256_AES128GCM_SHA256_P256
}

fn mls_error(context: &str, error: impl std::fmt::Debug) -> DaveError {
    DaveError::MlsFailure {
        reason: format!("{context}: {error:?}"),
    }
}

/// The MLS session of one voice connection.
pub struct MlsSession {
    provider: OpenMlsRustCrypto,
    protocol_version: u8,
    group_id: Vec<u8>,
    bot_user_id: Snowflake,

    signature_keys: Option<SignatureKeyPair>,
    credential_with_key: Option<CredentialWithKey>,
    external_sender: Option<ExternalSender>,

    group: Option<MlsGroup>,
    /// Whether `group` went through a commit or welcome, as opposed to being
    /// our local, not yet acknowledged epoch 0 group.
    group_established: bool,
    /// Serialized form of the commit we produced from the last proposals, to
    /// recognize it when the gateway announces the winning commit.
    pending_commit_bytes: Option<Vec<u8>>,

    roster: RosterMap,
}

impl MlsSession {
    /// Creates a session and its signature identity. With a session id the
    /// signature key pair is persisted across reconnects, otherwise it is
    /// transient.
    pub fn new(
        protocol_version: u8,
        group_id: Snowflake,
        bot_user_id: Snowflake,
        auth_session_id: Option<&str>,
    ) -> Result<MlsSession, DaveError> {
        debug!("DAVE: Creating a new MLS session");

        let mut session = MlsSession {
            provider: OpenMlsRustCrypto::default(),
            protocol_version,
            group_id: group_id.0.to_be_bytes().to_vec(),
            bot_user_id,
            signature_keys: None,
            credential_with_key: None,
            external_sender: None,
            group: None,
            group_established: false,
            pending_commit_bytes: None,
            roster: RosterMap::new(),
        };
        session.init_identity(auth_session_id)?;
        Ok(session)
    }

    pub fn protocol_version(&self) -> u8 {
        self.protocol_version
    }

    pub fn set_protocol_version(&mut self, version: u8) {
        self.protocol_version = version;
    }

    /// Generates or loads the signature key pair and builds our basic
    /// credential (the 64 bit user id, big endian).
    fn init_identity(&mut self, auth_session_id: Option<&str>) -> Result<(), DaveError> {
        let scheme = ciphersuite().signature_algorithm();
        let signature_keys = match auth_session_id {
            Some(session_id) if !session_id.is_empty() => {
                super::persisted_key_pair::get_persisted_key_pair(session_id, scheme)?
            }
            _ => super::persisted_key_pair::transient_key_pair(scheme)?,
        };

        signature_keys
            .store(self.provider.key_store())
            .map_err(|e| mls_error("failed to store signature key pair", e))?;

        let credential = Credential::new(
            self.bot_user_id.0.to_be_bytes().to_vec(),
            CredentialType::Basic,
        )
        .map_err(|e| mls_error("failed to create credential", e))?;

        self.credential_with_key = Some(CredentialWithKey {
            credential,
            signature_key: signature_keys.public().into(),
        });
        self.signature_keys = Some(signature_keys);

        debug!("DAVE: Created MLS leaf identity");
        Ok(())
    }

    /// Installs the voice gateway's external sender; must happen before any
    /// group is created or joined.
    pub fn set_external_sender(&mut self, external_sender: &[u8]) -> Result<(), DaveError> {
        if self.group_established {
            warn!("DAVE: Cannot set external sender after joining/creating an MLS group");
            return Err(DaveError::MlsFailure {
                reason: "external sender arrived after group establishment".to_string(),
            });
        }

        debug!("DAVE: Unmarshalling MLS external sender");
        let sender = ExternalSender::tls_deserialize(&mut &*external_sender)
            .map_err(|e| mls_error("failed to unmarshal external sender", e))?;
        self.external_sender = Some(sender);

        if !self.group_id.is_empty() {
            self.create_pending_group()?;
        }
        Ok(())
    }

    /// Creates our local epoch 0 group. If nobody else is in the call the
    /// gateway will announce our own first commit and this group becomes the
    /// established one; otherwise we are welcomed into the existing group
    /// instead.
    fn create_pending_group(&mut self) -> Result<(), DaveError> {
        let Some(external_sender) = self.external_sender.clone() else {
            debug!("DAVE: Cannot create MLS group without external sender");
            return Ok(());
        };
        let Some(credential_with_key) = self.credential_with_key.clone() else {
            warn!("DAVE: Cannot create MLS group without a leaf identity");
            return Ok(());
        };

        debug!("DAVE: Creating a pending MLS group");

        let config = MlsGroupConfig::builder()
            .crypto_config(CryptoConfig::with_default_version(ciphersuite()))
            .wire_format_policy(PURE_PLAINTEXT_WIRE_FORMAT_POLICY)
            .use_ratchet_tree_extension(true)
            .external_senders(vec![external_sender])
            .build();

        let group = MlsGroup::new_with_group_id(
            &self.provider,
            self.signature_keys.as_ref().expect("identity initialized"),
            &config,
            GroupId::from_slice(&self.group_id),
            credential_with_key,
        )
        .map_err(|e| mls_error("failed to create MLS group", e))?;

        self.group = Some(group);
        self.group_established = false;
        self.pending_commit_bytes = None;
        debug!("DAVE: Created a pending MLS group");
        Ok(())
    }

    /// Key packages are single use; every time the gateway asks for one we
    /// build a fresh one.
    pub fn get_marshalled_key_package(&mut self) -> Result<Vec<u8>, DaveError> {
        let Some(credential_with_key) = self.credential_with_key.clone() else {
            return Err(DaveError::MlsFailure {
                reason: "cannot marshal a key package without an identity".to_string(),
            });
        };

        let key_package = KeyPackage::builder()
            .build(
                CryptoConfig::with_default_version(ciphersuite()),
                &self.provider,
                self.signature_keys.as_ref().expect("identity initialized"),
                credential_with_key,
            )
            .map_err(|e| mls_error("failed to build key package", e))?;

        key_package
            .tls_serialize_detached()
            .map_err(|e| mls_error("failed to marshal key package", e))
    }

    /// Processes a proposals payload (`flag byte || MLSMessage*`) from the
    /// external sender and answers with our serialized commit, plus a welcome
    /// when the commit adds members.
    pub fn process_proposals(
        &mut self,
        proposals: &[u8],
        recognized_user_ids: &BTreeSet<Snowflake>,
    ) -> Result<Vec<u8>, DaveError> {
        if self.group.is_none() {
            return Err(DaveError::MlsFailure {
                reason: "cannot process proposals without a pending or established group"
                    .to_string(),
            });
        }

        debug!(
            "DAVE: Processing MLS proposals message of {} bytes",
            proposals.len()
        );

        let (&is_revoke, mut remaining) = proposals.split_first().ok_or(DaveError::MlsFailure {
            reason: "empty proposals payload".to_string(),
        })?;

        if is_revoke != 0 {
            trace!("DAVE: Revoking from proposals");
            self.revoke_proposals(&mut remaining)?;
        } else {
            self.queue_proposals(&mut remaining, recognized_user_ids)?;
        }

        // generate a commit (and a welcome if members were added)
        let group = self.group.as_mut().expect("checked above");
        let (commit, welcome, _group_info) = group
            .commit_to_pending_proposals(
                &self.provider,
                self.signature_keys.as_ref().expect("identity initialized"),
            )
            .map_err(|e| mls_error("failed to commit to pending proposals", e))?;

        let commit_bytes = commit
            .tls_serialize_detached()
            .map_err(|e| mls_error("failed to marshal commit", e))?;

        // keep a copy of the commit so we can match the winning commit later
        self.pending_commit_bytes = Some(commit_bytes.clone());

        let mut response = commit_bytes;
        if let Some(welcome) = welcome {
            let welcome_bytes = welcome
                .tls_serialize_detached()
                .map_err(|e| mls_error("failed to marshal welcome", e))?;
            response.extend_from_slice(&welcome_bytes);
        }

        debug!("DAVE: Prepared commit/welcome for MLS group from received proposals");
        Ok(response)
    }

    /// Validates and stages add/remove proposals from the external sender.
    fn queue_proposals(
        &mut self,
        remaining: &mut &[u8],
        recognized_user_ids: &BTreeSet<Snowflake>,
    ) -> Result<(), DaveError> {
        let group = self.group.as_mut().expect("caller checked");

        while !remaining.is_empty() {
            let message = MlsMessageIn::tls_deserialize(remaining)
                .map_err(|e| mls_error("failed to parse proposal message", e))?;
            let protocol_message = message
                .try_into_protocol_message()
                .map_err(|e| mls_error("proposal is not a protocol message", e))?;

            let processed = group
                .process_message(&self.provider, protocol_message)
                .map_err(|e| mls_error("failed to process proposal", e))?;

            match processed.into_content() {
                ProcessedMessageContent::ProposalMessage(proposal) => {
                    if !Self::validate_proposal(&proposal, recognized_user_ids) {
                        return Err(DaveError::MlsFailure {
                            reason: "proposal failed validation".to_string(),
                        });
                    }
                    group.store_pending_proposal(*proposal);
                }
                _ => {
                    return Err(DaveError::MlsFailure {
                        reason: "proposals payload contained a non-proposal message".to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Drops previously queued proposals named by the revocation list.
    fn revoke_proposals(&mut self, remaining: &mut &[u8]) -> Result<(), DaveError> {
        let group = self.group.as_mut().expect("caller checked");

        while !remaining.is_empty() {
            let ref_bytes = tls_codec::VLBytes::tls_deserialize(remaining)
                .map_err(|e| mls_error("failed to parse proposal ref", e))?;

            let matching = group
                .pending_proposals()
                .find(|queued| queued.proposal_reference().as_slice() == ref_bytes.as_slice())
                .map(|queued| queued.proposal_reference().clone());

            match matching {
                Some(proposal_ref) => {
                    group
                        .remove_pending_proposal(proposal_ref)
                        .map_err(|e| mls_error("failed to remove pending proposal", e))?;
                }
                None => {
                    debug!("DAVE: Cannot revoke unrecognized proposal ref");
                    return Err(DaveError::MlsFailure {
                        reason: "unrecognized proposal revocation".to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    fn validate_proposal(
        proposal: &QueuedProposal,
        recognized_user_ids: &BTreeSet<Snowflake>,
    ) -> bool {
        if !matches!(proposal.sender(), Sender::External(_)) {
            warn!("DAVE: MLS proposal must be from external sender");
            return false;
        }

        match proposal.proposal() {
            Proposal::Add(add) => {
                let identity = add.key_package().leaf_node().credential().identity().to_vec();
                if !Self::is_recognized_identity(&identity, recognized_user_ids) {
                    warn!("DAVE: MLS add proposal must be for a recognized user");
                    return false;
                }
                true
            }
            // Remove proposals are always allowed (openmls validates that
            // the removed member exists)
            Proposal::Remove(_) => true,
            _ => {
                warn!("DAVE: MLS proposal must be add or remove");
                false
            }
        }
    }

    fn is_recognized_identity(
        identity: &[u8],
        recognized_user_ids: &BTreeSet<Snowflake>,
    ) -> bool {
        let Some(user_id) = identity_to_user_id(identity) else {
            warn!("DAVE: Attempted to verify credential of unexpected shape");
            return false;
        };

        if !recognized_user_ids.contains(&Snowflake(user_id)) {
            warn!("DAVE: Attempted to verify credential for unrecognized user ID: {user_id}");
            return false;
        }

        true
    }

    /// Applies the winning commit the gateway announced. If it is the commit
    /// we produced ourselves, our cached next state is adopted instead of
    /// re-processing the message.
    pub fn process_commit(&mut self, commit: &[u8]) -> CommitProcessing {
        debug!("DAVE: Processing commit");

        let Some(group) = self.group.as_mut() else {
            warn!("DAVE: process_commit called without a group");
            return CommitProcessing::Ignored;
        };

        if self.pending_commit_bytes.as_deref() == Some(commit) {
            // we're the winning sender; adopt our cached state
            if let Err(e) = group.merge_pending_commit(&self.provider) {
                warn!("DAVE: Failed to merge own pending commit: {e:?}");
                return CommitProcessing::Failed;
            }
        } else {
            // someone else's commit won; drop ours and process theirs
            group.clear_pending_commit();

            let message = match MlsMessageIn::tls_deserialize(&mut &*commit) {
                Ok(message) => message,
                Err(e) => {
                    warn!("DAVE: Failed to parse MLS commit: {e:?}");
                    return CommitProcessing::Failed;
                }
            };
            let protocol_message = match message.try_into_protocol_message() {
                Ok(message) => message,
                Err(e) => {
                    warn!("DAVE: MLS commit is not a protocol message: {e:?}");
                    return CommitProcessing::Failed;
                }
            };

            if protocol_message.group_id().as_slice() != self.group_id {
                warn!("DAVE: MLS commit message was for unexpected group");
                return CommitProcessing::Ignored;
            }

            let processed = match group.process_message(&self.provider, protocol_message) {
                Ok(processed) => processed,
                Err(e) => {
                    warn!("DAVE: Failed to process MLS commit: {e:?}");
                    return CommitProcessing::Failed;
                }
            };

            match processed.into_content() {
                ProcessedMessageContent::StagedCommitMessage(staged_commit) => {
                    if let Err(e) = group.merge_staged_commit(&self.provider, *staged_commit) {
                        warn!("DAVE: Failed to merge staged commit: {e:?}");
                        return CommitProcessing::Failed;
                    }
                }
                _ => {
                    warn!("DAVE: process_commit called with a non-commit message");
                    return CommitProcessing::Failed;
                }
            }
        }

        self.pending_commit_bytes = None;
        self.group_established = true;

        debug!(
            "DAVE: Successfully processed MLS commit, current epoch is {}",
            self.group.as_ref().map(|g| g.epoch().as_u64()).unwrap_or(0)
        );

        CommitProcessing::RosterUpdate(self.replace_roster())
    }

    /// Joins the group we were welcomed into.
    pub fn process_welcome(
        &mut self,
        welcome: &[u8],
        recognized_user_ids: &BTreeSet<Snowflake>,
    ) -> Result<RosterMap, DaveError> {
        if self.external_sender.is_none() {
            return Err(DaveError::MlsFailure {
                reason: "cannot process welcome without an external sender".to_string(),
            });
        }

        if self.group_established {
            return Err(DaveError::MlsFailure {
                reason: "cannot process welcome after joining an MLS group".to_string(),
            });
        }

        let message = MlsMessageIn::tls_deserialize(&mut &*welcome)
            .map_err(|e| mls_error("failed to parse welcome", e))?;
        let MlsMessageInBody::Welcome(welcome_body) = message.extract() else {
            return Err(DaveError::MlsFailure {
                reason: "welcome payload did not contain a welcome message".to_string(),
            });
        };

        let config = MlsGroupConfig::builder()
            .crypto_config(CryptoConfig::with_default_version(ciphersuite()))
            .wire_format_policy(PURE_PLAINTEXT_WIRE_FORMAT_POLICY)
            .use_ratchet_tree_extension(true)
            .build();

        let group = MlsGroup::new_from_welcome(&self.provider, &config, welcome_body, None)
            .map_err(|e| mls_error("failed to create group from welcome", e))?;

        self.verify_welcome_group(&group, recognized_user_ids)?;

        debug!(
            "DAVE: Successfully welcomed to MLS group, current epoch is {}",
            group.epoch().as_u64()
        );

        self.group = Some(group);
        self.group_established = true;
        self.pending_commit_bytes = None;

        Ok(self.replace_roster())
    }

    /// Application-level verification of a welcomed group: the external
    /// sender must be the one the gateway told us about.
    fn verify_welcome_group(
        &self,
        group: &MlsGroup,
        recognized_user_ids: &BTreeSet<Snowflake>,
    ) -> Result<(), DaveError> {
        let expected = self.external_sender.as_ref().expect("caller checked");

        let Some(senders) = group.extensions().external_senders() else {
            return Err(DaveError::MlsFailure {
                reason: "welcome missing external senders extension".to_string(),
            });
        };

        if senders.len() != 1 {
            return Err(DaveError::MlsFailure {
                reason: format!(
                    "welcome lists unexpected number of external senders: {}",
                    senders.len()
                ),
            });
        }

        if senders.first() != Some(expected) {
            return Err(DaveError::MlsFailure {
                reason: "welcome lists unexpected external sender".to_string(),
            });
        }

        for member in group.members() {
            if !Self::is_recognized_identity(member.credential.identity(), recognized_user_ids) {
                // deliberately only a warning: a recently disconnected user
                // can still be listed in the welcome
                warn!("DAVE: MLS welcome lists unrecognized user ID");
            }
        }

        Ok(())
    }

    /// Recomputes the roster from the group and returns the change map:
    /// added or changed users map to their signature key, removed users map
    /// to an empty value.
    fn replace_roster(&mut self) -> RosterMap {
        let mut new_roster = RosterMap::new();
        if let Some(group) = &self.group {
            for member in group.members() {
                if let Some(user_id) = identity_to_user_id(member.credential.identity()) {
                    new_roster.insert(user_id, member.signature_key.clone());
                }
            }
        }

        let mut change_map = RosterMap::new();
        for (user_id, key) in &new_roster {
            if self.roster.get(user_id) != Some(key) {
                change_map.insert(*user_id, key.clone());
            }
        }
        for user_id in self.roster.keys() {
            if !new_roster.contains_key(user_id) {
                change_map.insert(*user_id, Vec::new());
            }
        }

        self.roster = new_roster;
        change_map
    }

    /// Exports the base secret for `user_id` and wraps it in a hash ratchet.
    pub fn get_key_ratchet(&self, user_id: Snowflake) -> Option<MlsKeyRatchet> {
        let group = self.group.as_ref()?;
        if !self.group_established {
            warn!("DAVE: Cannot get key ratchet without an established MLS group");
            return None;
        }

        // the export context is the little endian 64 bit user ID
        let context = user_id.0.to_le_bytes();
        let base_secret = group
            .export_secret(
                &self.provider,
                USER_MEDIA_KEY_BASE_LABEL,
                &context,
                AES_GCM_128_KEY_BYTES,
            )
            .ok()?;

        Some(MlsKeyRatchet::new(Zeroizing::new(base_secret)))
    }

    /// The per-epoch authenticator everyone in the group agrees on; feeds the
    /// session verification code.
    pub fn get_last_epoch_authenticator(&self) -> Vec<u8> {
        let Some(group) = self.group.as_ref().filter(|_| self.group_established) else {
            debug!("DAVE: Cannot get epoch authenticator without an established MLS group");
            return Vec::new();
        };
        group.epoch_authenticator().as_slice().to_vec()
    }

    /// The key material needed for a pairwise verification fingerprint with
    /// `user_id`: our own public signature key and theirs from the roster.
    pub fn pairwise_fingerprint_material(
        &self,
        user_id: Snowflake,
    ) -> Option<(Vec<u8>, Vec<u8>)> {
        let own_key = self.signature_keys.as_ref()?.public().to_vec();
        let their_key = self.roster.get(&user_id.0).filter(|key| !key.is_empty())?;
        Some((own_key, their_key.clone()))
    }

    pub fn bot_user_id(&self) -> Snowflake {
        self.bot_user_id
    }

    pub fn roster(&self) -> &RosterMap {
        &self.roster
    }
}

fn identity_to_user_id(identity: &[u8]) -> Option<u64> {
    Some(u64::from_be_bytes(identity.try_into().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_conversion() {
        let id = 1234567890123u64;
        assert_eq!(identity_to_user_id(&id.to_be_bytes()), Some(id));
        assert_eq!(identity_to_user_id(&[1, 2, 3]), None);
    }

    #[test]
    fn session_produces_key_packages() {
        let mut session =
            MlsSession::new(1, Snowflake(42), Snowflake(1000), None).unwrap();

        let first = session.get_marshalled_key_package().unwrap();
        let second = session.get_marshalled_key_package().unwrap();
        assert!(!first.is_empty());
        // key packages are single use, so each request yields a fresh one
        assert_ne!(first, second);
    }

    #[test]
    fn external_sender_after_establishment_is_rejected() {
        let mut session =
            MlsSession::new(1, Snowflake(42), Snowflake(1000), None).unwrap();
        session.group_established = true;
        assert!(session.set_external_sender(&[0u8; 4]).is_err());
    }

    #[test]
    fn roster_diff_reports_added_and_removed() {
        let mut session =
            MlsSession::new(1, Snowflake(42), Snowflake(1000), None).unwrap();

        // simulate an established roster and diff against a shrunk one
        session.roster.insert(1, vec![0xaa]);
        session.roster.insert(2, vec![0xbb]);

        // no group: new roster is empty, both users report as removed
        let changes = session.replace_roster();
        assert_eq!(changes.get(&1), Some(&Vec::new()));
        assert_eq!(changes.get(&2), Some(&Vec::new()));
        assert!(session.roster().is_empty());
    }
}
