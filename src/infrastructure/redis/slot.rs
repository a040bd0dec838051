//! Hash tags for per-slot keys.
//!
//! Per-slot index keys need a tag that lands on a specific slot, so a table
//! of the shortest tag for every slot is computed once on first use.

use lazy_static::lazy_static;
use redis::cluster_routing::get_slot;

pub const SLOT_COUNT: u16 = 16384;

const TAG_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

lazy_static! {
    static ref MINIMAL_HASH_TAGS: Vec<String> = build_minimal_hash_tags();
}

/// Shortest hash tag whose slot is `slot`.
pub fn minimal_hash_tag(slot: u16) -> &'static str {
    &MINIMAL_HASH_TAGS[(slot % SLOT_COUNT) as usize]
}

fn build_minimal_hash_tags() -> Vec<String> {
    let mut tags: Vec<Option<String>> = vec![None; SLOT_COUNT as usize];
    let mut remaining = SLOT_COUNT as usize;
    let mut len = 1u32;

    while remaining > 0 {
        let combinations = TAG_ALPHABET.len().pow(len);
        for index in 0..combinations {
            let tag = tag_at(index, len);
            let entry = &mut tags[get_slot(tag.as_bytes()) as usize];
            if entry.is_none() {
                *entry = Some(tag);
                remaining -= 1;
                if remaining == 0 {
                    break;
                }
            }
        }
        len += 1;
    }

    tags.into_iter().map(Option::unwrap_or_default).collect()
}

fn tag_at(mut index: usize, len: u32) -> String {
    let mut tag = vec![0u8; len as usize];
    for position in (0..len as usize).rev() {
        tag[position] = TAG_ALPHABET[index % TAG_ALPHABET.len()];
        index /= TAG_ALPHABET.len();
    }
    String::from_utf8_lossy(&tag).into_owned()
}
