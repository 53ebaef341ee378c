use crate::event::{EventTemplate, UnsignedEvent};
use crate::Pubkey;

use tracing::debug;

/// NIP-13 tag name carrying the nonce and the target difficulty.
const NONCE_TAG: &str = "nonce";

/// Upper bound on hash attempts for one mining run. Difficulty `d` needs
/// about `2^d` attempts; 2^26 comfortably covers the difficulties relays
/// ask for in practice while bounding a hostile `pow: 60` demand.
const MAX_ITERATIONS: u64 = 1 << 26;

/// Mines a nonce tag until the event id carries `target` leading zero
/// bits. Returns None when the iteration budget runs out; the caller
/// reports the relay's demand as unmet instead of spinning forever.
pub fn mine(template: EventTemplate, pubkey: Pubkey, target: u32) -> Option<UnsignedEvent> {
    let mut template = template;
    template
        .tags
        .retain(|tag| tag.first().map(String::as_str) != Some(NONCE_TAG));
    template.tags.push(vec![
        NONCE_TAG.to_owned(),
        "0".to_owned(),
        target.to_string(),
    ]);
    let nonce_index = template.tags.len() - 1;

    for nonce in 0..MAX_ITERATIONS {
        template.tags[nonce_index][1] = nonce.to_string();
        let unsigned = template.clone().unsigned(pubkey);
        if unsigned.id.pow_difficulty() >= target {
            debug!(
                "mined difficulty {} (target {target}) after {nonce} attempts",
                unsigned.id.pow_difficulty()
            );
            return Some(unsigned);
        }
    }
    None
}

/// Pulls the demanded difficulty out of an `OK false` message like
/// `pow: difficulty 8 required`.
pub fn parse_pow_demand(message: &str) -> Option<u32> {
    let digits: String = message
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}
