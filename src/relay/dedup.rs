//! Dual-SIM arbitration of the shared activation request.
//!
//! Both client endpoints share one upstream. Only one of them may trigger
//! the activation request; once upstream has answered it, the same request
//! from the other client is answered from the cached response with its
//! correlation token rewritten, without reaching upstream.
//!
//! Payload layout (little-endian `i32` words):
//!
//! ```text
//! request:  [code][serial]...
//! response: [type (0 = solicited)][serial][error]...
//! ```
//!
//! All state lives behind one mutex and every decision is made under it.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::framing::{encode_record, HEADER_LEN};
use crate::relay::endpoint::ClientSlot;

const SOLICITED: i32 = 0;
const SERIAL_OFFSET: usize = 4;

/// Who currently holds the activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// Nobody.
    Inactive,
    /// The given client's request was answered successfully.
    Active(ClientSlot),
}

/// What the relay should do with a client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestAction {
    /// Relay it upstream as usual.
    Forward,
    /// Send this encoded record back to the requesting client instead.
    Reply(Vec<u8>),
}

#[derive(Debug)]
struct DedupState {
    last_serial: [Option<i32>; 2],
    activation: Activation,
    /// Full encoded (header + payload) response to the activating request.
    cached_response: Option<Vec<u8>>,
}

impl Default for DedupState {
    fn default() -> Self {
        Self {
            last_serial: [None, None],
            activation: Activation::Inactive,
            cached_response: None,
        }
    }
}

/// Process-wide arbitration state shared by every relay path.
#[derive(Debug)]
pub struct DedupPolicy {
    enabled: bool,
    trigger: i32,
    release: Vec<i32>,
    state: Mutex<DedupState>,
}

impl DedupPolicy {
    /// Create a policy reacting to `trigger` and cleared by any of `release`.
    #[must_use]
    pub fn new(enabled: bool, trigger: i32, release: Vec<i32>) -> Self {
        Self {
            enabled,
            trigger,
            release,
            state: Mutex::new(DedupState::default()),
        }
    }

    /// A policy that never intervenes.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(false, 0, Vec::new())
    }

    /// Current activation holder.
    #[must_use]
    pub fn activation(&self) -> Activation {
        self.lock().activation
    }

    /// Decide how to handle a request payload from `slot`.
    ///
    /// A repeated trigger from the client that already holds the activation
    /// passes through to upstream untouched; only its serial is recorded.
    pub fn on_client_request(&self, slot: ClientSlot, payload: &[u8]) -> RequestAction {
        if !self.enabled {
            return RequestAction::Forward;
        }
        let (Some(code), Some(serial)) = (word(payload, 0), word(payload, SERIAL_OFFSET)) else {
            return RequestAction::Forward;
        };

        let mut state = self.lock();

        if self.release.contains(&code) {
            if state.activation != Activation::Inactive {
                log::info!("[dedup] {slot} released activation (code {code})");
            }
            state.activation = Activation::Inactive;
            state.cached_response = None;
            return RequestAction::Forward;
        }

        if code != self.trigger {
            return RequestAction::Forward;
        }

        state.last_serial[slot.index()] = Some(serial);
        let activation = state.activation;
        match activation {
            Activation::Inactive => RequestAction::Forward,
            Activation::Active(holder) if holder == slot => RequestAction::Forward,
            Activation::Active(holder) => {
                let Some(cached) = state.cached_response.as_ref() else {
                    return RequestAction::Forward;
                };
                let mut reply = cached.clone();
                let at = HEADER_LEN + SERIAL_OFFSET;
                reply[at..at + 4].copy_from_slice(&serial.to_le_bytes());
                state.last_serial[slot.index()] = None;
                log::info!(
                    "[dedup] answering {slot} serial {serial} from cache (held by {holder})"
                );
                RequestAction::Reply(reply)
            }
        }
    }

    /// Check whether an upstream payload answers a pending trigger request.
    ///
    /// Returns the originating client if so; the caller delivers the record
    /// to that client only. A successful answer marks that client as the
    /// activation holder and caches the encoded response.
    pub fn on_upstream_record(&self, payload: &[u8]) -> Option<ClientSlot> {
        if !self.enabled {
            return None;
        }
        let kind = word(payload, 0)?;
        let serial = word(payload, SERIAL_OFFSET)?;
        let error = word(payload, 8)?;
        if kind != SOLICITED {
            return None;
        }

        let mut state = self.lock();
        let slot = ClientSlot::ALL
            .into_iter()
            .find(|s| state.last_serial[s.index()] == Some(serial))?;
        state.last_serial[slot.index()] = None;

        if error == 0 {
            state.activation = Activation::Active(slot);
            state.cached_response = Some(encode_record(payload));
            log::info!("[dedup] {slot} now holds activation (serial {serial})");
        } else {
            log::debug!("[dedup] {slot} activation failed with error {error}");
        }
        Some(slot)
    }

    /// Forget a client that disconnected.
    ///
    /// Its pending serial is dropped; if it held the activation, the
    /// activation and cached response are cleared.
    pub fn forget(&self, slot: ClientSlot) {
        let mut state = self.lock();
        state.last_serial[slot.index()] = None;
        if state.activation == Activation::Active(slot) {
            state.activation = Activation::Inactive;
            state.cached_response = None;
        }
    }

    /// Clear everything (upstream went away).
    pub fn reset(&self) {
        *self.lock() = DedupState::default();
    }

    fn lock(&self) -> MutexGuard<'_, DedupState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn word(payload: &[u8], offset: usize) -> Option<i32> {
    let bytes = payload.get(offset..offset + 4)?;
    Some(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRIGGER: i32 = 27;
    const RELEASE: i32 = 41;

    fn request(code: i32, serial: i32) -> Vec<u8> {
        let mut p = code.to_le_bytes().to_vec();
        p.extend_from_slice(&serial.to_le_bytes());
        p.extend_from_slice(b"args");
        p
    }

    fn response(serial: i32, error: i32) -> Vec<u8> {
        let mut p = SOLICITED.to_le_bytes().to_vec();
        p.extend_from_slice(&serial.to_le_bytes());
        p.extend_from_slice(&error.to_le_bytes());
        p.extend_from_slice(b"data-call-state");
        p
    }

    fn policy() -> DedupPolicy {
        DedupPolicy::new(true, TRIGGER, vec![RELEASE])
    }

    #[test]
    fn test_disabled_policy_always_forwards() {
        let p = DedupPolicy::disabled();
        assert_eq!(
            p.on_client_request(ClientSlot::Primary, &request(TRIGGER, 1)),
            RequestAction::Forward
        );
        assert_eq!(p.on_upstream_record(&response(1, 0)), None);
    }

    #[test]
    fn test_second_client_answered_from_cache() {
        let p = policy();
        assert_eq!(
            p.on_client_request(ClientSlot::Primary, &request(TRIGGER, 10)),
            RequestAction::Forward
        );
        assert_eq!(p.on_upstream_record(&response(10, 0)), Some(ClientSlot::Primary));
        assert_eq!(p.activation(), Activation::Active(ClientSlot::Primary));

        let action = p.on_client_request(ClientSlot::Secondary, &request(TRIGGER, 77));
        let RequestAction::Reply(record) = action else {
            panic!("expected cached reply, got {action:?}");
        };
        let payload = &record[HEADER_LEN..];
        assert_eq!(word(payload, SERIAL_OFFSET), Some(77));
        assert_eq!(&payload[12..], b"data-call-state");
    }

    #[test]
    fn test_holder_repeat_request_is_forwarded() {
        let p = policy();
        p.on_client_request(ClientSlot::Secondary, &request(TRIGGER, 3));
        p.on_upstream_record(&response(3, 0));
        assert_eq!(
            p.on_client_request(ClientSlot::Secondary, &request(TRIGGER, 4)),
            RequestAction::Forward
        );
    }

    #[test]
    fn test_release_clears_activation() {
        let p = policy();
        p.on_client_request(ClientSlot::Primary, &request(TRIGGER, 1));
        p.on_upstream_record(&response(1, 0));
        p.on_client_request(ClientSlot::Secondary, &request(RELEASE, 2));
        assert_eq!(p.activation(), Activation::Inactive);
        assert_eq!(
            p.on_client_request(ClientSlot::Secondary, &request(TRIGGER, 3)),
            RequestAction::Forward
        );
    }

    #[test]
    fn test_failed_response_routes_without_activating() {
        let p = policy();
        p.on_client_request(ClientSlot::Primary, &request(TRIGGER, 5));
        assert_eq!(p.on_upstream_record(&response(5, 2)), Some(ClientSlot::Primary));
        assert_eq!(p.activation(), Activation::Inactive);
    }

    #[test]
    fn test_unrelated_response_not_claimed() {
        let p = policy();
        p.on_client_request(ClientSlot::Primary, &request(TRIGGER, 5));
        assert_eq!(p.on_upstream_record(&response(6, 0)), None);
        // Unsolicited (type 1) with a matching serial is not a response.
        let mut unsolicited = response(5, 0);
        unsolicited[..4].copy_from_slice(&1i32.to_le_bytes());
        assert_eq!(p.on_upstream_record(&unsolicited), None);
    }

    #[test]
    fn test_short_payloads_ignored() {
        let p = policy();
        assert_eq!(p.on_client_request(ClientSlot::Primary, &[27, 0]), RequestAction::Forward);
        assert_eq!(p.on_upstream_record(&[0, 0, 0, 0, 1]), None);
    }

    #[test]
    fn test_forget_holder_clears_activation() {
        let p = policy();
        p.on_client_request(ClientSlot::Primary, &request(TRIGGER, 1));
        p.on_upstream_record(&response(1, 0));
        p.forget(ClientSlot::Secondary);
        assert_eq!(p.activation(), Activation::Active(ClientSlot::Primary));
        p.forget(ClientSlot::Primary);
        assert_eq!(p.activation(), Activation::Inactive);
    }
}
