//! Header-chain locator selection.
//!
//! After each `headers` message the peer decides between continuing the
//! header catch-up (`getheaders`) and switching to block download
//! (`getblocks`), and computes the two block-locator hashes describing the
//! message window. Locators are proof-of-work block hashes, so legacy
//! headers are re-hashed with X16R or X16Rv2 and KAWPOW headers go through
//! light verification.

use crate::chain::header::Header;
use crate::pow::{reverse32, sha256d, Hash256, HeaderHasher};
use crate::wire::constants::{Network, BLOCK_MAX_TIME_DRIFT};

/// One week: headers older than this before the earliest key time carry no
/// wallet-relevant transactions and are skipped during block download.
const KEY_TIME_WINDOW: u32 = 7 * 24 * 60 * 60;

/// The request to issue after processing a `headers` message. Locators are
/// ordered `[tail, head]`: the newest relevant block first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextRequest {
    GetHeaders { locators: [Hash256; 2] },
    GetBlocks { locators: [Hash256; 2] },
}

/// A `headers` message that continues neither the catch-up nor the switch
/// to block download; the peer treats this as a protocol violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonStandardHeaders;

/// Proof-of-work block hash of a single header.
///
/// Legacy headers select X16R or X16Rv2 by their own timestamp. KAWPOW
/// headers derive the hash from the double-SHA256 header commitment, the
/// mix hash and the 64-bit nonce; the 32-byte values are byte-reversed
/// around the light verification call to match canonical display order.
pub fn header_locator(header: &Header, network: Network, hasher: &dyn HeaderHasher) -> Hash256 {
    match header {
        Header::Legacy(raw) => {
            if header.time() >= network.x16rv2_activation() {
                hasher.x16rv2(raw)
            } else {
                hasher.x16r(raw)
            }
        }
        Header::Kawpow(_) => {
            let commitment = reverse32(sha256d(header.prefix80()));
            let mix = reverse32(header.mix_hash().expect("kawpow header"));
            let nonce = header.nonce64().expect("kawpow header");
            reverse32(hasher.kawpow_light(commitment, mix, nonce))
        }
    }
}

/// Assesses a decoded `headers` message and selects the follow-up request.
///
/// Catch-up continues while the message is full (2000 headers) or its last
/// timestamp has entered the week-long window before `earliest_key_time`.
/// Inside the window the peer switches to `getblocks`, first walking the
/// tail locator forward past headers too old to matter to the wallet.
pub fn assess(
    headers: &[Header],
    network: Network,
    earliest_key_time: u32,
    hasher: &dyn HeaderHasher,
) -> Result<NextRequest, NonStandardHeaders> {
    let count = headers.len();
    let last_time = match headers.last() {
        Some(header) => header.time(),
        None => return Err(NonStandardHeaders),
    };

    let in_window =
        |time: u32| time > 0 && time + KEY_TIME_WINDOW + BLOCK_MAX_TIME_DRIFT >= earliest_key_time;

    if count < 2000 && !in_window(last_time) {
        return Err(NonStandardHeaders);
    }

    let head = header_locator(&headers[0], network, hasher);

    if in_window(last_time) {
        // skip headers that predate the key-time window; the tail locator
        // is the last header still outside it
        let mut last = 1;
        while last < count && !in_window(headers[last].time()) {
            last += 1;
        }
        let tail = header_locator(&headers[last - 1], network, hasher);
        Ok(NextRequest::GetBlocks {
            locators: [tail, head],
        })
    } else {
        let tail = header_locator(&headers[count - 1], network, hasher);
        Ok(NextRequest::GetHeaders {
            locators: [tail, head],
        })
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::FakeHasher;
    use super::*;
    use crate::chain::header::test_support::{kawpow_header, legacy_header};

    const NET: Network = Network::Mainnet;

    fn x16rv2_era(offset: u32) -> u32 {
        NET.x16rv2_activation() + offset
    }

    fn kawpow_era(offset: u32) -> u32 {
        NET.kawpow_activation() + offset
    }

    fn legacy_run(start: u32, step: u32, count: usize) -> Vec<Header> {
        (0..count)
            .map(|i| Header::Legacy(legacy_header(start + step * i as u32)))
            .collect()
    }

    #[test]
    fn full_message_outside_window_requests_more_headers() {
        let headers = legacy_run(x16rv2_era(0), 60, 2000);
        let earliest = kawpow_era(KEY_TIME_WINDOW * 10);

        let next = assess(&headers, NET, earliest, &FakeHasher).unwrap();
        let expected_tail = header_locator(&headers[1999], NET, &FakeHasher);
        let expected_head = header_locator(&headers[0], NET, &FakeHasher);
        assert_eq!(
            next,
            NextRequest::GetHeaders {
                locators: [expected_tail, expected_head]
            }
        );
    }

    #[test]
    fn short_message_outside_window_is_non_standard() {
        let headers = legacy_run(x16rv2_era(0), 60, 10);
        let earliest = kawpow_era(KEY_TIME_WINDOW * 10);
        assert_eq!(assess(&headers, NET, earliest, &FakeHasher), Err(NonStandardHeaders));
    }

    #[test]
    fn empty_message_is_non_standard() {
        assert_eq!(assess(&[], NET, 0, &FakeHasher), Err(NonStandardHeaders));
    }

    #[test]
    fn message_entering_window_switches_to_getblocks() {
        // 10 headers, the first four older than the key-time window
        let earliest = x16rv2_era(KEY_TIME_WINDOW + BLOCK_MAX_TIME_DRIFT + 3600 * 4);
        let headers = legacy_run(x16rv2_era(0), 3600, 10);

        let next = assess(&headers, NET, earliest, &FakeHasher).unwrap();
        // headers[4] is the first within the window, so the tail locator
        // walks to headers[3]
        let expected_tail = header_locator(&headers[3], NET, &FakeHasher);
        let expected_head = header_locator(&headers[0], NET, &FakeHasher);
        assert_eq!(
            next,
            NextRequest::GetBlocks {
                locators: [expected_tail, expected_head]
            }
        );
    }

    #[test]
    fn message_fully_inside_window_anchors_getblocks_at_head() {
        let headers = legacy_run(x16rv2_era(0), 60, 5);
        let earliest = x16rv2_era(0); // everything is recent

        let next = assess(&headers, NET, earliest, &FakeHasher).unwrap();
        let head = header_locator(&headers[0], NET, &FakeHasher);
        assert_eq!(
            next,
            NextRequest::GetBlocks {
                locators: [head, head]
            }
        );
    }

    #[test]
    fn legacy_locator_selects_algorithm_per_header_timestamp() {
        let pre = Header::Legacy(legacy_header(NET.x16rv2_activation() - 1));
        let post = Header::Legacy(legacy_header(NET.x16rv2_activation()));

        let pre_hash = header_locator(&pre, NET, &FakeHasher);
        let post_hash = header_locator(&post, NET, &FakeHasher);

        let raw_pre = match &pre {
            Header::Legacy(raw) => *raw,
            _ => unreachable!(),
        };
        assert_eq!(pre_hash, FakeHasher.x16r(&raw_pre));
        assert_ne!(post_hash, {
            let raw_post = match &post {
                Header::Legacy(raw) => *raw,
                _ => unreachable!(),
            };
            FakeHasher.x16r(&raw_post)
        });
    }

    #[test]
    fn kawpow_locator_reverses_commitment_mix_and_result() {
        let header = Header::Kawpow(kawpow_header(kawpow_era(60), 12, 0xDEADBEEF, [0x5A; 32]));
        let locator = header_locator(&header, NET, &FakeHasher);

        let commitment = reverse32(sha256d(header.prefix80()));
        let mix = reverse32([0x5A; 32]);
        let expected = reverse32(FakeHasher.kawpow_light(commitment, mix, 0xDEADBEEF));
        assert_eq!(locator, expected);
    }

    #[test]
    fn mixed_message_uses_kawpow_tail_and_legacy_head() {
        // 500 legacy headers followed by 1500 KAWPOW headers, still far
        // behind the wallet birth date: expect getheaders with a
        // KAWPOW-derived tail and an X16Rv2-derived head.
        let mut headers = legacy_run(x16rv2_era(0), 60, 500);
        for i in 0..1500u32 {
            headers.push(Header::Kawpow(kawpow_header(
                kawpow_era(60 * i),
                i,
                i as u64,
                [i as u8; 32],
            )));
        }
        let earliest = kawpow_era(60 * 1500 + KEY_TIME_WINDOW * 10);

        let next = assess(&headers, NET, earliest, &FakeHasher).unwrap();
        let NextRequest::GetHeaders { locators } = next else {
            panic!("expected GetHeaders");
        };
        assert_eq!(locators[0], header_locator(&headers[1999], NET, &FakeHasher));
        assert_eq!(locators[1], header_locator(&headers[0], NET, &FakeHasher));
        assert!(headers[1999].is_kawpow());
        assert!(!headers[0].is_kawpow());
    }
}
