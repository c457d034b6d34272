//! Token State
//!
//! The non-UTXO side of the token layer: issuance records, ownership
//! scripts, and restricted-token metadata (qualifier tags, address and
//! global freezes, verifier strings). Layered exactly like the coin views
//! and flushed in lockstep with them; every mutation made while connecting
//! a block produces a [`TokenUndo`] entry that reverses it on disconnect.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use plumecoin_core::{Amount, Script};
use plumecoin_storage::{keys, IndexDb, WriteBatch};

use crate::error::ChainError;

/// The issuance record of one token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenIssuance {
    /// Total units issued so far
    pub amount: Amount,
    /// Decimal places
    pub units: u8,
    /// Whether further reissuance is allowed
    pub reissuable: bool,
    /// Optional content hash attached at issuance
    pub ipfs_hash: Option<[u8; 32]>,
    /// Height of the issuing block
    pub height: u64,
}

/// One reversible token-state mutation, recorded while connecting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenUndo {
    IssuanceCreated { name: String },
    IssuanceReplaced { name: String, prev: TokenIssuance },
    OwnershipCreated { name: String },
    OwnershipReplaced { name: String, prev: Script },
    TagChanged { qualifier: String, address: [u8; 20], prev: bool },
    AddressFreezeChanged { name: String, address: [u8; 20], prev: bool },
    GlobalFreezeChanged { name: String, prev: bool },
    VerifierChanged { name: String, prev: Option<String> },
}

/// Read capability over token state
pub trait TokenView {
    fn issuance(&self, name: &str) -> Result<Option<TokenIssuance>, ChainError>;
    fn ownership(&self, name: &str) -> Result<Option<Script>, ChainError>;
    fn tag(&self, qualifier: &str, address: &[u8; 20]) -> Result<bool, ChainError>;
    fn address_frozen(&self, name: &str, address: &[u8; 20]) -> Result<bool, ChainError>;
    fn global_frozen(&self, name: &str) -> Result<bool, ChainError>;
    fn verifier(&self, name: &str) -> Result<Option<String>, ChainError>;
}

/// Pending writes of one token layer
#[derive(Debug, Clone, Default)]
pub struct TokenDelta {
    pub issuances: HashMap<String, Option<TokenIssuance>>,
    pub ownerships: HashMap<String, Option<Script>>,
    pub tags: HashMap<(String, [u8; 20]), bool>,
    pub address_freezes: HashMap<(String, [u8; 20]), bool>,
    pub global_freezes: HashMap<String, bool>,
    pub verifiers: HashMap<String, Option<String>>,
}

impl TokenDelta {
    pub fn is_empty(&self) -> bool {
        self.issuances.is_empty()
            && self.ownerships.is_empty()
            && self.tags.is_empty()
            && self.address_freezes.is_empty()
            && self.global_freezes.is_empty()
            && self.verifiers.is_empty()
    }

    /// Fold another delta over this one
    pub fn merge(&mut self, other: TokenDelta) {
        self.issuances.extend(other.issuances);
        self.ownerships.extend(other.ownerships);
        self.tags.extend(other.tags);
        self.address_freezes.extend(other.address_freezes);
        self.global_freezes.extend(other.global_freezes);
        self.verifiers.extend(other.verifiers);
    }
}

/// Database-backed bottom layer
pub struct DbTokenView {
    db: Arc<IndexDb>,
}

impl DbTokenView {
    pub fn new(db: Arc<IndexDb>) -> Self {
        DbTokenView { db }
    }

    fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        key: Vec<u8>,
    ) -> Result<Option<T>, ChainError> {
        self.db
            .get_json(&key)
            .map_err(|e| ChainError::System(e.to_string()))
    }

    fn get_bool(&self, key: Vec<u8>) -> Result<bool, ChainError> {
        Ok(self
            .db
            .get(&key)
            .map_err(|e| ChainError::System(e.to_string()))?
            .map(|v| v.first() == Some(&1))
            .unwrap_or(false))
    }
}

impl TokenView for DbTokenView {
    fn issuance(&self, name: &str) -> Result<Option<TokenIssuance>, ChainError> {
        self.get_json(keys::token_issuance_key(name))
    }

    fn ownership(&self, name: &str) -> Result<Option<Script>, ChainError> {
        self.get_json(keys::token_ownership_key(name))
    }

    fn tag(&self, qualifier: &str, address: &[u8; 20]) -> Result<bool, ChainError> {
        self.get_bool(keys::qualifier_tag_key(qualifier, address))
    }

    fn address_frozen(&self, name: &str, address: &[u8; 20]) -> Result<bool, ChainError> {
        self.get_bool(keys::address_freeze_key(name, address))
    }

    fn global_frozen(&self, name: &str) -> Result<bool, ChainError> {
        self.get_bool(keys::global_freeze_key(name))
    }

    fn verifier(&self, name: &str) -> Result<Option<String>, ChainError> {
        self.get_json(keys::verifier_key(name))
    }
}

macro_rules! layered_read {
    ($self:ident, $field:ident, $key:expr, $fallback:expr) => {
        if let Some(value) = $self.delta.$field.get(&$key) {
            return Ok(value.clone());
        } else {
            return $fallback;
        }
    };
}

/// Long-lived tip cache over the database view
pub struct TipTokenCache {
    base: DbTokenView,
    delta: TokenDelta,
}

impl TipTokenCache {
    pub fn new(db: Arc<IndexDb>) -> Self {
        TipTokenCache {
            base: DbTokenView::new(db),
            delta: TokenDelta::default(),
        }
    }

    pub fn apply(&mut self, delta: TokenDelta) {
        self.delta.merge(delta);
    }

    /// Write the pending delta into the batch and clear it
    pub fn flush_into(&mut self, batch: &mut WriteBatch) -> Result<(), ChainError> {
        let delta = std::mem::take(&mut self.delta);
        let to_sys = |e: plumecoin_storage::StorageError| ChainError::System(e.to_string());
        for (name, issuance) in delta.issuances {
            let key = keys::token_issuance_key(&name);
            match issuance {
                Some(record) => batch.put_json(key, &record).map_err(to_sys)?,
                None => batch.delete(key),
            }
        }
        for (name, ownership) in delta.ownerships {
            let key = keys::token_ownership_key(&name);
            match ownership {
                Some(script) => batch.put_json(key, &script).map_err(to_sys)?,
                None => batch.delete(key),
            }
        }
        for ((qualifier, address), value) in delta.tags {
            let key = keys::qualifier_tag_key(&qualifier, &address);
            if value {
                batch.put(key, vec![1]);
            } else {
                batch.delete(key);
            }
        }
        for ((name, address), value) in delta.address_freezes {
            let key = keys::address_freeze_key(&name, &address);
            if value {
                batch.put(key, vec![1]);
            } else {
                batch.delete(key);
            }
        }
        for (name, value) in delta.global_freezes {
            let key = keys::global_freeze_key(&name);
            if value {
                batch.put(key, vec![1]);
            } else {
                batch.delete(key);
            }
        }
        for (name, verifier) in delta.verifiers {
            let key = keys::verifier_key(&name);
            match verifier {
                Some(v) => batch.put_json(key, &v).map_err(to_sys)?,
                None => batch.delete(key),
            }
        }
        Ok(())
    }
}

impl TokenView for TipTokenCache {
    fn issuance(&self, name: &str) -> Result<Option<TokenIssuance>, ChainError> {
        layered_read!(self, issuances, name.to_string(), self.base.issuance(name))
    }

    fn ownership(&self, name: &str) -> Result<Option<Script>, ChainError> {
        layered_read!(self, ownerships, name.to_string(), self.base.ownership(name))
    }

    fn tag(&self, qualifier: &str, address: &[u8; 20]) -> Result<bool, ChainError> {
        layered_read!(
            self,
            tags,
            (qualifier.to_string(), *address),
            self.base.tag(qualifier, address)
        )
    }

    fn address_frozen(&self, name: &str, address: &[u8; 20]) -> Result<bool, ChainError> {
        layered_read!(
            self,
            address_freezes,
            (name.to_string(), *address),
            self.base.address_frozen(name, address)
        )
    }

    fn global_frozen(&self, name: &str) -> Result<bool, ChainError> {
        layered_read!(
            self,
            global_freezes,
            name.to_string(),
            self.base.global_frozen(name)
        )
    }

    fn verifier(&self, name: &str) -> Result<Option<String>, ChainError> {
        layered_read!(self, verifiers, name.to_string(), self.base.verifier(name))
    }
}

/// Transient per-block overlay; the undo-producing mutation surface
pub struct TokenOverlay<'a> {
    base: &'a dyn TokenView,
    delta: TokenDelta,
}

impl<'a> TokenOverlay<'a> {
    pub fn new(base: &'a dyn TokenView) -> Self {
        TokenOverlay {
            base,
            delta: TokenDelta::default(),
        }
    }

    pub fn into_delta(self) -> TokenDelta {
        self.delta
    }

    /// Record a new issuance
    pub fn issue(
        &mut self,
        name: &str,
        record: TokenIssuance,
        undo: &mut Vec<TokenUndo>,
    ) -> Result<(), ChainError> {
        if self.issuance(name)?.is_some() {
            return Err(ChainError::invalid(
                "token-already-issued",
                format!("token {name} already exists"),
            ));
        }
        self.delta.issuances.insert(name.to_string(), Some(record));
        undo.push(TokenUndo::IssuanceCreated {
            name: name.to_string(),
        });
        Ok(())
    }

    /// Add supply / update metadata of a reissuable token
    pub fn reissue(
        &mut self,
        name: &str,
        add_amount: Amount,
        reissuable: bool,
        ipfs_hash: Option<[u8; 32]>,
        undo: &mut Vec<TokenUndo>,
    ) -> Result<(), ChainError> {
        let prev = self.issuance(name)?.ok_or_else(|| {
            ChainError::invalid("token-not-issued", format!("token {name} does not exist"))
        })?;
        if !prev.reissuable {
            return Err(ChainError::invalid(
                "token-not-reissuable",
                format!("token {name} is locked"),
            ));
        }
        let mut next = prev.clone();
        next.amount = next.amount.saturating_add(add_amount);
        next.reissuable = reissuable;
        if ipfs_hash.is_some() {
            next.ipfs_hash = ipfs_hash;
        }
        self.delta.issuances.insert(name.to_string(), Some(next));
        undo.push(TokenUndo::IssuanceReplaced {
            name: name.to_string(),
            prev,
        });
        Ok(())
    }

    /// Assign the ownership token's holder script
    pub fn set_ownership(
        &mut self,
        name: &str,
        holder: Script,
        undo: &mut Vec<TokenUndo>,
    ) -> Result<(), ChainError> {
        let prev = self.ownership(name)?;
        self.delta.ownerships.insert(name.to_string(), Some(holder));
        undo.push(match prev {
            Some(prev) => TokenUndo::OwnershipReplaced {
                name: name.to_string(),
                prev,
            },
            None => TokenUndo::OwnershipCreated {
                name: name.to_string(),
            },
        });
        Ok(())
    }

    pub fn set_tag(
        &mut self,
        qualifier: &str,
        address: [u8; 20],
        value: bool,
        undo: &mut Vec<TokenUndo>,
    ) -> Result<(), ChainError> {
        let prev = self.tag(qualifier, &address)?;
        self.delta
            .tags
            .insert((qualifier.to_string(), address), value);
        undo.push(TokenUndo::TagChanged {
            qualifier: qualifier.to_string(),
            address,
            prev,
        });
        Ok(())
    }

    pub fn set_address_freeze(
        &mut self,
        name: &str,
        address: [u8; 20],
        value: bool,
        undo: &mut Vec<TokenUndo>,
    ) -> Result<(), ChainError> {
        let prev = self.address_frozen(name, &address)?;
        self.delta
            .address_freezes
            .insert((name.to_string(), address), value);
        undo.push(TokenUndo::AddressFreezeChanged {
            name: name.to_string(),
            address,
            prev,
        });
        Ok(())
    }

    pub fn set_global_freeze(
        &mut self,
        name: &str,
        value: bool,
        undo: &mut Vec<TokenUndo>,
    ) -> Result<(), ChainError> {
        let prev = self.global_frozen(name)?;
        self.delta.global_freezes.insert(name.to_string(), value);
        undo.push(TokenUndo::GlobalFreezeChanged {
            name: name.to_string(),
            prev,
        });
        Ok(())
    }

    pub fn set_verifier(
        &mut self,
        name: &str,
        verifier: String,
        undo: &mut Vec<TokenUndo>,
    ) -> Result<(), ChainError> {
        let prev = self.verifier(name)?;
        self.delta
            .verifiers
            .insert(name.to_string(), Some(verifier));
        undo.push(TokenUndo::VerifierChanged {
            name: name.to_string(),
            prev,
        });
        Ok(())
    }

    /// Reverse one recorded mutation; callers iterate the undo list in
    /// reverse order
    pub fn revert(&mut self, undo: &TokenUndo) {
        match undo {
            TokenUndo::IssuanceCreated { name } => {
                self.delta.issuances.insert(name.clone(), None);
            }
            TokenUndo::IssuanceReplaced { name, prev } => {
                self.delta.issuances.insert(name.clone(), Some(prev.clone()));
            }
            TokenUndo::OwnershipCreated { name } => {
                self.delta.ownerships.insert(name.clone(), None);
            }
            TokenUndo::OwnershipReplaced { name, prev } => {
                self.delta
                    .ownerships
                    .insert(name.clone(), Some(prev.clone()));
            }
            TokenUndo::TagChanged {
                qualifier,
                address,
                prev,
            } => {
                self.delta.tags.insert((qualifier.clone(), *address), *prev);
            }
            TokenUndo::AddressFreezeChanged {
                name,
                address,
                prev,
            } => {
                self.delta
                    .address_freezes
                    .insert((name.clone(), *address), *prev);
            }
            TokenUndo::GlobalFreezeChanged { name, prev } => {
                self.delta.global_freezes.insert(name.clone(), *prev);
            }
            TokenUndo::VerifierChanged { name, prev } => {
                self.delta.verifiers.insert(name.clone(), prev.clone());
            }
        }
    }
}

impl TokenView for TokenOverlay<'_> {
    fn issuance(&self, name: &str) -> Result<Option<TokenIssuance>, ChainError> {
        layered_read!(self, issuances, name.to_string(), self.base.issuance(name))
    }

    fn ownership(&self, name: &str) -> Result<Option<Script>, ChainError> {
        layered_read!(self, ownerships, name.to_string(), self.base.ownership(name))
    }

    fn tag(&self, qualifier: &str, address: &[u8; 20]) -> Result<bool, ChainError> {
        layered_read!(
            self,
            tags,
            (qualifier.to_string(), *address),
            self.base.tag(qualifier, address)
        )
    }

    fn address_frozen(&self, name: &str, address: &[u8; 20]) -> Result<bool, ChainError> {
        layered_read!(
            self,
            address_freezes,
            (name.to_string(), *address),
            self.base.address_frozen(name, address)
        )
    }

    fn global_frozen(&self, name: &str) -> Result<bool, ChainError> {
        layered_read!(
            self,
            global_freezes,
            name.to_string(),
            self.base.global_frozen(name)
        )
    }

    fn verifier(&self, name: &str) -> Result<Option<String>, ChainError> {
        layered_read!(self, verifiers, name.to_string(), self.base.verifier(name))
    }
}

/// Whether a restricted-token transfer to `address` is permitted under the
/// current freezes and verifier string
pub fn transfer_allowed(
    view: &dyn TokenView,
    name: &str,
    address: &[u8; 20],
) -> Result<(), ChainError> {
    if !name.starts_with('$') {
        return Ok(());
    }
    if view.global_frozen(name)? {
        return Err(ChainError::invalid(
            "token-globally-frozen",
            format!("{name} is globally frozen"),
        ));
    }
    if view.address_frozen(name, address)? {
        return Err(ChainError::invalid(
            "token-address-frozen",
            format!("recipient frozen for {name}"),
        ));
    }
    if let Some(verifier) = view.verifier(name)? {
        let requirement = verifier.trim();
        if !requirement.is_empty() && requirement != "true" && !view.tag(requirement, address)? {
            return Err(ChainError::invalid(
                "token-verifier-failed",
                format!("recipient lacks qualifier {requirement}"),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Arc<IndexDb> {
        let dir = tempfile::tempdir().unwrap();
        let db = IndexDb::open(dir.path().join("index.db")).unwrap();
        std::mem::forget(dir);
        Arc::new(db)
    }

    fn issuance(amount: Amount) -> TokenIssuance {
        TokenIssuance {
            amount,
            units: 0,
            reissuable: true,
            ipfs_hash: None,
            height: 5,
        }
    }

    #[test]
    fn test_issue_and_undo_roundtrip() {
        let db = test_db();
        let tip = TipTokenCache::new(db);
        let mut overlay = TokenOverlay::new(&tip);
        let mut undo = Vec::new();

        overlay.issue("EMBER", issuance(1000), &mut undo).unwrap();
        assert!(overlay.issuance("EMBER").unwrap().is_some());
        // Double issue is rejected.
        assert!(overlay.issue("EMBER", issuance(1), &mut undo).is_err());

        for entry in undo.iter().rev() {
            overlay.revert(entry);
        }
        assert!(overlay.issuance("EMBER").unwrap().is_none());
    }

    #[test]
    fn test_reissue_respects_lock() {
        let db = test_db();
        let tip = TipTokenCache::new(db);
        let mut overlay = TokenOverlay::new(&tip);
        let mut undo = Vec::new();

        let mut locked = issuance(100);
        locked.reissuable = false;
        overlay.issue("LOCKED", locked, &mut undo).unwrap();
        assert!(overlay
            .reissue("LOCKED", 50, false, None, &mut undo)
            .is_err());

        overlay.issue("OPEN", issuance(100), &mut undo).unwrap();
        overlay.reissue("OPEN", 50, true, None, &mut undo).unwrap();
        assert_eq!(overlay.issuance("OPEN").unwrap().unwrap().amount, 150);
    }

    #[test]
    fn test_delta_flush_and_reload() {
        let db = test_db();
        {
            let mut tip = TipTokenCache::new(db.clone());
            let mut overlay = TokenOverlay::new(&tip);
            let mut undo = Vec::new();
            overlay.issue("EMBER", issuance(5), &mut undo).unwrap();
            overlay
                .set_global_freeze("$GATED", true, &mut undo)
                .unwrap();
            tip.apply(overlay.into_delta());

            let mut batch = WriteBatch::new();
            tip.flush_into(&mut batch).unwrap();
            db.commit(batch).unwrap();
        }
        let tip = TipTokenCache::new(db);
        assert_eq!(tip.issuance("EMBER").unwrap().unwrap().amount, 5);
        assert!(tip.global_frozen("$GATED").unwrap());
        assert!(!tip.global_frozen("$OTHER").unwrap());
    }

    #[test]
    fn test_transfer_allowed_rules() {
        let db = test_db();
        let tip = TipTokenCache::new(db);
        let mut overlay = TokenOverlay::new(&tip);
        let mut undo = Vec::new();
        let address = [7u8; 20];

        // Unrestricted tokens always pass.
        transfer_allowed(&overlay, "EMBER", &address).unwrap();

        // Verifier demands a qualifier tag.
        overlay
            .set_verifier("$GATED", "#KYC".to_string(), &mut undo)
            .unwrap();
        assert!(transfer_allowed(&overlay, "$GATED", &address).is_err());
        overlay.set_tag("#KYC", address, true, &mut undo).unwrap();
        transfer_allowed(&overlay, "$GATED", &address).unwrap();

        // Address freeze overrides the tag.
        overlay
            .set_address_freeze("$GATED", address, true, &mut undo)
            .unwrap();
        assert!(transfer_allowed(&overlay, "$GATED", &address).is_err());

        // Global freeze blocks everyone.
        let other = [8u8; 20];
        overlay.set_tag("#KYC", other, true, &mut undo).unwrap();
        overlay
            .set_global_freeze("$GATED", true, &mut undo)
            .unwrap();
        assert!(transfer_allowed(&overlay, "$GATED", &other).is_err());
    }
}
