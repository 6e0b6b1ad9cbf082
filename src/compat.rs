//! Write-set extraction for Solana messages
//!
//! Solana SDK has two message formats:
//! - Legacy messages (original format)
//! - V0 messages (with address lookup tables)
//!
//! Both encode writability the same way for their static keys: the message
//! header splits the key list into signed/unsigned and writable/readonly
//! ranges. V0 messages may additionally reference writable accounts through
//! lookup tables; those are only known once the tables are loaded, so callers
//! pass them in as `LoadedAddresses`.
//!
//! ```text
//! [ signed writable | signed readonly | unsigned writable | unsigned readonly ]
//! ```

use solana_sdk::{
    message::{v0::LoadedAddresses, MessageHeader, VersionedMessage},
    pubkey::Pubkey,
};
use std::collections::BTreeSet;

/// Get the message header from a `VersionedMessage`.
#[inline]
#[must_use]
pub fn get_message_header(message: &VersionedMessage) -> &MessageHeader {
    match message {
        VersionedMessage::Legacy(legacy_msg) => &legacy_msg.header,
        VersionedMessage::V0(v0_msg) => &v0_msg.header,
    }
}

/// Get the static account keys from a `VersionedMessage`.
///
/// For V0 messages this excludes addresses loaded from lookup tables.
#[inline]
#[must_use]
pub fn get_static_account_keys(message: &VersionedMessage) -> &[Pubkey] {
    match message {
        VersionedMessage::Legacy(legacy_msg) => &legacy_msg.account_keys,
        VersionedMessage::V0(v0_msg) => &v0_msg.account_keys,
    }
}

/// Whether the static key at `index` is writable according to the header.
#[must_use]
pub fn is_static_writable(header: &MessageHeader, num_keys: usize, index: usize) -> bool {
    if index >= num_keys {
        return false;
    }
    let num_signed = header.num_required_signatures as usize;
    if index < num_signed {
        let num_signed_writable =
            num_signed.saturating_sub(header.num_readonly_signed_accounts as usize);
        index < num_signed_writable
    } else {
        let num_unsigned_writable_end =
            num_keys.saturating_sub(header.num_readonly_unsigned_accounts as usize);
        index < num_unsigned_writable_end
    }
}

/// Accounts the message may mutate, from its static keys only.
///
/// Duplicate keys collapse; iteration order of the result is by pubkey.
#[must_use]
pub fn static_write_set(message: &VersionedMessage) -> BTreeSet<Pubkey> {
    let header = get_message_header(message);
    let keys = get_static_account_keys(message);
    keys.iter()
        .enumerate()
        .filter(|(i, _)| is_static_writable(header, keys.len(), *i))
        .map(|(_, key)| *key)
        .collect()
}

/// Number of writable accounts a V0 message pulls in through lookup tables.
///
/// Always zero for legacy messages.
#[must_use]
pub fn lookup_writable_count(message: &VersionedMessage) -> usize {
    match message {
        VersionedMessage::Legacy(_) => 0,
        VersionedMessage::V0(v0_msg) => v0_msg
            .address_table_lookups
            .iter()
            .map(|lookup| lookup.writable_indexes.len())
            .sum(),
    }
}

/// Accounts the message may mutate, including lookup-table writable
/// addresses the caller has already resolved.
#[must_use]
pub fn write_set_with_loaded(
    message: &VersionedMessage,
    loaded: &LoadedAddresses,
) -> BTreeSet<Pubkey> {
    let mut write_set = static_write_set(message);
    write_set.extend(loaded.writable.iter().copied());
    write_set
}
