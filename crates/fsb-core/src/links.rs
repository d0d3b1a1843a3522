//! `/start` deep-link payloads.
//!
//! Two shapes exist:
//! - `verify-<user_id>-<token>` redeems a verification token.
//! - URL-safe base64 of `get-<n>` or `get-<first>-<last>`, where each number is
//!   a store-channel message id multiplied by `|channel_id|`. Ranges may run
//!   backwards.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};

use crate::{
    domain::{MessageId, UserId},
    errors::Error,
    Result,
};

/// Upper bound on messages one link may deliver.
pub const MAX_LINK_RANGE: usize = 200;

const VERIFY_PREFIX: &str = "verify-";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StartPayload {
    Verify { user_id: UserId, token: String },
    Files(Vec<MessageId>),
}

pub fn parse_start_payload(payload: &str, channel_id: i64) -> Result<StartPayload> {
    let payload = payload.trim();
    if let Some(rest) = payload.strip_prefix(VERIFY_PREFIX) {
        return parse_verify(rest);
    }
    decode_file_link(payload, channel_id).map(StartPayload::Files)
}

pub fn verify_payload(user_id: UserId, token: &str) -> String {
    format!("{VERIFY_PREFIX}{}-{token}", user_id.0)
}

pub fn encode_file_link(first: MessageId, last: Option<MessageId>, channel_id: i64) -> String {
    let factor = i128::from(channel_id).abs();
    let scaled = |id: MessageId| i128::from(id.0) * factor;
    let raw = match last {
        Some(last) if last != first => format!("get-{}-{}", scaled(first), scaled(last)),
        _ => format!("get-{}", scaled(first)),
    };
    URL_SAFE_NO_PAD.encode(raw)
}

pub fn decode_file_link(encoded: &str, channel_id: i64) -> Result<Vec<MessageId>> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .map_err(|_| invalid_link())?;
    let raw = String::from_utf8(bytes).map_err(|_| invalid_link())?;

    let parts: Vec<&str> = raw.split('-').collect();
    match parts.as_slice() {
        ["get", one] => Ok(vec![unscale(one, channel_id)?]),
        ["get", first, last] => {
            let first = unscale(first, channel_id)?;
            let last = unscale(last, channel_id)?;
            expand_range(first, last)
        }
        _ => Err(invalid_link()),
    }
}

fn parse_verify(rest: &str) -> Result<StartPayload> {
    let Some((uid, token)) = rest.split_once('-') else {
        return Err(Error::Validation("invalid token format".to_string()));
    };
    let user_id = uid
        .parse::<i64>()
        .map_err(|_| Error::Validation("invalid token format".to_string()))?;
    if token.is_empty() {
        return Err(Error::Validation("invalid token format".to_string()));
    }
    Ok(StartPayload::Verify {
        user_id: UserId(user_id),
        token: token.to_string(),
    })
}

fn unscale(raw: &str, channel_id: i64) -> Result<MessageId> {
    let factor = i128::from(channel_id).abs();
    if factor == 0 {
        return Err(Error::Config("store channel id is zero".to_string()));
    }
    let n: i128 = raw.parse().map_err(|_| invalid_link())?;
    if n <= 0 || n % factor != 0 {
        return Err(invalid_link());
    }
    i32::try_from(n / factor)
        .map(MessageId)
        .map_err(|_| invalid_link())
}

fn expand_range(first: MessageId, last: MessageId) -> Result<Vec<MessageId>> {
    let len = (i64::from(first.0) - i64::from(last.0)).unsigned_abs() as usize + 1;
    if len > MAX_LINK_RANGE {
        return Err(Error::Validation(format!(
            "link covers {len} files; the limit is {MAX_LINK_RANGE}"
        )));
    }
    Ok(if first <= last {
        (first.0..=last.0).map(MessageId).collect()
    } else {
        (last.0..=first.0).rev().map(MessageId).collect()
    })
}

fn invalid_link() -> Error {
    Error::Validation("invalid or corrupted link".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHANNEL: i64 = -1001234567890;

    #[test]
    fn single_and_range_links_decode_to_message_ids() {
        let one = encode_file_link(MessageId(42), None, CHANNEL);
        assert_eq!(
            parse_start_payload(&one, CHANNEL).unwrap(),
            StartPayload::Files(vec![MessageId(42)])
        );

        let range = encode_file_link(MessageId(5), Some(MessageId(8)), CHANNEL);
        assert_eq!(
            decode_file_link(&range, CHANNEL).unwrap(),
            vec![MessageId(5), MessageId(6), MessageId(7), MessageId(8)]
        );
    }

    #[test]
    fn descending_range_is_delivered_in_link_order() {
        let link = encode_file_link(MessageId(9), Some(MessageId(7)), CHANNEL);
        assert_eq!(
            decode_file_link(&link, CHANNEL).unwrap(),
            vec![MessageId(9), MessageId(8), MessageId(7)]
        );
    }

    #[test]
    fn padded_links_from_other_encoders_are_accepted() {
        let raw = format!("get-{}", 3 * CHANNEL.abs());
        let padded = base64::engine::general_purpose::URL_SAFE.encode(raw);
        assert_eq!(decode_file_link(&padded, CHANNEL).unwrap(), vec![MessageId(3)]);
    }

    #[test]
    fn links_for_another_channel_are_rejected() {
        let link = encode_file_link(MessageId(3), None, -1009999999999);
        assert!(decode_file_link(&link, CHANNEL).is_err());
        assert!(decode_file_link("not base64!!", CHANNEL).is_err());
    }

    #[test]
    fn oversized_ranges_are_rejected() {
        let link = encode_file_link(MessageId(1), Some(MessageId(10_000)), CHANNEL);
        assert!(matches!(
            decode_file_link(&link, CHANNEL),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn verify_payload_keeps_the_token_intact() {
        let p = verify_payload(UserId(77), "AbC123xyz0AbC123");
        assert_eq!(
            parse_start_payload(&p, CHANNEL).unwrap(),
            StartPayload::Verify {
                user_id: UserId(77),
                token: "AbC123xyz0AbC123".to_string()
            }
        );
        assert!(parse_start_payload("verify-abc-tok", CHANNEL).is_err());
        assert!(parse_start_payload("verify-12-", CHANNEL).is_err());
    }
}
