//! Set-reconciliation: client and server variants over one shared stepping
//! function. The reconciler never talks to the network directly — it
//! consumes an incoming [`Message`] and produces the next outgoing one (or
//! `None` once this side has nothing further to add), plus any ids each side
//! has learned the other needs.
//!
//! A matched `FINGERPRINT` and a processed `ID_LIST` still emit `SKIP(upper)`
//! so the range's boundary reaches the peer — dropping it would let the next
//! pushed range silently widen to cover the skipped span, and the peer would
//! compare its fingerprint against a wider interval than the sender meant.
//! `Message::encode` trims trailing `SKIP`s before putting bytes on the wire,
//! so this costs nothing once a round is actually done; it only matters when
//! a matched range sits in the middle, with a real mismatch still to follow.
//! When a reconciler has nothing left to emit, the caller (the
//! [`crate::relay`] layer) sends `NEG-CLOSE` instead of an empty `NEG-MSG`.

use std::collections::HashSet;

use super::bound::{Bound, ID_SIZE};
use super::error::NegentropyError;
use super::fingerprint::fingerprints_match;
use super::message::{Message, Mode, ID_LIST_THRESHOLD};
use super::storage::Storage;

pub const DEFAULT_FRAME_SIZE: usize = 60_000;
const FRAME_MARGIN: usize = 1_000;

/// Outcome of one reconciliation step.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    /// `None` once this side has nothing further to send — the connection
    /// layer should close the subscription rather than send an empty
    /// message.
    pub response: Option<Message>,
    /// Ids the peer is missing (we should offer/send them).
    pub have_ids: Vec<[u8; ID_SIZE]>,
    /// Ids we are missing (we should fetch them).
    pub need_ids: Vec<[u8; ID_SIZE]>,
}

impl StepOutcome {
    pub fn is_complete(&self) -> bool {
        self.response.is_none()
    }
}

struct Core<'s> {
    storage: &'s Storage,
    frame_limit: usize,
    pending: Vec<(Bound, Bound)>,
}

impl<'s> Core<'s> {
    fn new(storage: &'s Storage, frame_limit: usize) -> Self {
        Core {
            storage,
            frame_limit,
            pending: Vec::new(),
        }
    }

    fn budget(&self) -> usize {
        self.frame_limit.saturating_sub(FRAME_MARGIN)
    }

    /// Emits either a terminal `ID_LIST` of our items in `[lower, upper)` or,
    /// if there are too many, subdivides the range into two finer
    /// `FINGERPRINT`s.
    fn emit_mismatch(
        &self,
        lower: &Bound,
        upper: &Bound,
        output: &mut Message,
        size_estimate: &mut usize,
    ) -> Result<(), NegentropyError> {
        let count = self.storage.count_in_range(lower, upper)?;
        if count <= ID_LIST_THRESHOLD {
            let ids: Vec<_> = self
                .storage
                .range(lower, upper)?
                .iter()
                .map(|item| item.id)
                .collect();
            *size_estimate += 3 + ids.len() * ID_SIZE;
            output.push(upper.clone(), Mode::IdList(ids));
        } else {
            let mid = self.storage.midpoint(lower, upper)?;
            let fp_low = self.storage.fingerprint(lower, &mid)?;
            let fp_high = self.storage.fingerprint(&mid, upper)?;
            output.push(mid, Mode::Fingerprint(fp_low));
            output.push(upper.clone(), Mode::Fingerprint(fp_high));
            *size_estimate += 2 * (1 + 16 + 2);
        }
        Ok(())
    }

    fn step(&mut self, incoming: &Message) -> Result<StepOutcome, NegentropyError> {
        let mut output = Message::new();
        let mut have_ids = Vec::new();
        let mut need_ids = Vec::new();
        let mut lower = Bound::min();
        let mut size_estimate: usize = 1;
        let budget = self.budget();

        for range in &incoming.ranges {
            let upper = range.upper_bound.clone();

            let worst_case = size_estimate + 1 + 32 * 2 + ID_SIZE;
            if worst_case > budget {
                self.pending.push((lower.clone(), Bound::max()));
                break;
            }

            match &range.mode {
                Mode::Skip => {
                    let count = self.storage.count_in_range(&lower, &upper)?;
                    if count > 0 {
                        self.emit_mismatch(&lower, &upper, &mut output, &mut size_estimate)?;
                    }
                }
                Mode::Fingerprint(remote_fp) => {
                    let local_fp = self.storage.fingerprint(&lower, &upper)?;
                    if !fingerprints_match(&local_fp, remote_fp) {
                        self.emit_mismatch(&lower, &upper, &mut output, &mut size_estimate)?;
                    } else {
                        output.push(upper.clone(), Mode::Skip);
                        size_estimate += 2;
                    }
                }
                Mode::IdList(remote_ids) => {
                    let local_items = self.storage.range(&lower, &upper)?;
                    let remote_set: HashSet<&[u8; ID_SIZE]> = remote_ids.iter().collect();
                    let local_set: HashSet<[u8; ID_SIZE]> =
                        local_items.iter().map(|item| item.id).collect();

                    for item in local_items {
                        if !remote_set.contains(&item.id) {
                            have_ids.push(item.id);
                        }
                    }
                    for id in remote_ids {
                        if !local_set.contains(id) {
                            need_ids.push(*id);
                        }
                    }
                    output.push(upper.clone(), Mode::Skip);
                    size_estimate += 2;
                }
            }
            lower = upper;
        }

        if self.pending.is_empty() && output.is_empty_or_all_skip() {
            return Ok(StepOutcome {
                response: None,
                have_ids,
                need_ids,
            });
        }

        if !self.pending.is_empty() && output.is_empty_or_all_skip() {
            output = self.rebuild_from_pending(budget)?;
        }

        Ok(StepOutcome {
            response: Some(output),
            have_ids,
            need_ids,
        })
    }

    /// Folds deferred `(lower, upper)` ranges into fresh `FINGERPRINT`
    /// ranges, guaranteeing forward progress when a round's direct response
    /// would otherwise carry nothing despite unresolved work.
    fn rebuild_from_pending(&mut self, budget: usize) -> Result<Message, NegentropyError> {
        let mut output = Message::new();
        let mut size_estimate: usize = 1;
        let pending = std::mem::take(&mut self.pending);

        if let Some((first_lower, _)) = pending.first() {
            if *first_lower != Bound::min() {
                output.push(first_lower.clone(), Mode::Skip);
                size_estimate += 2;
            }
        }

        let mut iter = pending.into_iter().peekable();
        while let Some((lower, upper)) = iter.next() {
            if size_estimate + 1 + 16 + 2 > budget {
                let tail_lower = lower;
                self.pending.push((tail_lower.clone(), Bound::max()));
                let fp = self.storage.fingerprint(&tail_lower, &Bound::max())?;
                output.push(Bound::max(), Mode::Fingerprint(fp));
                break;
            }
            let fp = self.storage.fingerprint(&lower, &upper)?;
            output.push(upper, Mode::Fingerprint(fp));
            size_estimate += 1 + 16 + 2;
        }
        Ok(output)
    }
}

/// Client side: initiates the exchange.
pub struct ClientReconciler<'s> {
    core: Core<'s>,
}

impl<'s> ClientReconciler<'s> {
    pub fn new(storage: &'s Storage, frame_limit: usize) -> Self {
        ClientReconciler {
            core: Core::new(storage, frame_limit),
        }
    }

    /// Produces the opening message covering the whole range.
    pub fn initiate(&self) -> Result<Message, NegentropyError> {
        let mut msg = Message::new();
        if self.core.storage.is_empty() {
            msg.push(Bound::max(), Mode::Skip);
        } else {
            let fp = self.core.storage.fingerprint(&Bound::min(), &Bound::max())?;
            msg.push(Bound::max(), Mode::Fingerprint(fp));
        }
        Ok(msg)
    }

    pub fn reconcile(&mut self, incoming: &Message) -> Result<StepOutcome, NegentropyError> {
        self.core.step(incoming)
    }
}

/// Server side: never initiates, only responds.
pub struct ServerReconciler<'s> {
    core: Core<'s>,
}

impl<'s> ServerReconciler<'s> {
    pub fn new(storage: &'s Storage, frame_limit: usize) -> Self {
        ServerReconciler {
            core: Core::new(storage, frame_limit),
        }
    }

    pub fn reconcile(&mut self, incoming: &Message) -> Result<StepOutcome, NegentropyError> {
        self.core.step(incoming)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negentropy::bound::Item;

    fn id(byte: u8) -> [u8; ID_SIZE] {
        let mut b = [0u8; ID_SIZE];
        b[0] = byte;
        b
    }

    fn storage_of(items: &[(u32, u8)]) -> Storage {
        Storage::from_items(items.iter().map(|(ts, b)| Item::new(*ts, id(*b))))
    }

    /// Drives a full client/server exchange to convergence, returning the
    /// accumulated `(have_ids, need_ids)` across every step on both sides.
    fn drive(
        client: &mut ClientReconciler,
        server: &mut ServerReconciler,
    ) -> (Vec<[u8; ID_SIZE]>, Vec<[u8; ID_SIZE]>) {
        let mut have = Vec::new();
        let mut need = Vec::new();
        let mut msg = client.initiate().unwrap();
        let mut turn_is_server = true;
        for _ in 0..64 {
            let outcome = if turn_is_server {
                server.reconcile(&msg).unwrap()
            } else {
                client.reconcile(&msg).unwrap()
            };
            have.extend(outcome.have_ids);
            need.extend(outcome.need_ids);
            match outcome.response {
                None => break,
                Some(next) => msg = next,
            }
            turn_is_server = !turn_is_server;
        }
        (have, need)
    }

    #[test]
    fn identical_sets_converge_with_no_id_exchange() {
        let items = [(100, 0xaa), (200, 0xbb)];
        let client_storage = storage_of(&items);
        let server_storage = storage_of(&items);

        let mut client = ClientReconciler::new(&client_storage, DEFAULT_FRAME_SIZE);
        let mut server = ServerReconciler::new(&server_storage, DEFAULT_FRAME_SIZE);

        let (have, need) = drive(&mut client, &mut server);
        assert!(have.is_empty());
        assert!(need.is_empty());
    }

    #[test]
    fn single_missing_event_surfaces_as_have_on_the_fuller_side() {
        let client_storage = storage_of(&[(100, 0xaa), (200, 0xbb)]);
        let server_storage = storage_of(&[(100, 0xaa)]);

        let mut client = ClientReconciler::new(&client_storage, DEFAULT_FRAME_SIZE);
        let mut server = ServerReconciler::new(&server_storage, DEFAULT_FRAME_SIZE);

        let (have, need) = drive(&mut client, &mut server);
        assert_eq!(have, vec![id(0xbb)]);
        assert!(need.is_empty());
    }

    #[test]
    fn subdivision_isolates_lone_missing_item() {
        let full: Vec<(u32, u8)> = (1u32..=30).map(|ts| (ts * 100, ts as u8)).collect();
        let client_storage = storage_of(&full);
        let missing_ts = 15 * 100;
        let partial: Vec<_> = full.into_iter().filter(|(ts, _)| *ts != missing_ts).collect();
        let server_storage = storage_of(&partial);

        let mut client = ClientReconciler::new(&client_storage, DEFAULT_FRAME_SIZE);
        let mut server = ServerReconciler::new(&server_storage, DEFAULT_FRAME_SIZE);

        let (have, need) = drive(&mut client, &mut server);
        assert_eq!(need, vec![id(15)]);
        assert!(have.is_empty());
    }

    #[test]
    fn count_exactly_at_threshold_still_uses_id_list_not_subdivision() {
        let items: Vec<_> = (1u32..=ID_LIST_THRESHOLD as u32)
            .map(|ts| (ts, ts as u8))
            .collect();
        let client_storage = storage_of(&items);
        let server_storage = Storage::from_items(std::iter::empty());

        let client = ClientReconciler::new(&client_storage, DEFAULT_FRAME_SIZE);
        let opening = client.initiate().unwrap();
        assert!(matches!(opening.ranges[0].mode, Mode::Fingerprint(_)));

        let mut server = ServerReconciler::new(&server_storage, DEFAULT_FRAME_SIZE);
        let server_step = server.reconcile(&opening).unwrap();
        let response = server_step.response.unwrap();
        assert!(matches!(response.ranges[0].mode, Mode::IdList(_)));
    }

    #[test]
    fn empty_local_storage_emits_single_skip_and_learns_all_peer_ids_as_need() {
        let client_storage = Storage::from_items(std::iter::empty());
        let server_storage = storage_of(&[(100, 0xaa), (200, 0xbb)]);

        let client = ClientReconciler::new(&client_storage, DEFAULT_FRAME_SIZE);
        let opening = client.initiate().unwrap();
        assert_eq!(opening.ranges.len(), 1);
        assert!(matches!(opening.ranges[0].mode, Mode::Skip));

        let mut client = ClientReconciler::new(&client_storage, DEFAULT_FRAME_SIZE);
        let mut server = ServerReconciler::new(&server_storage, DEFAULT_FRAME_SIZE);
        let (have, need) = drive(&mut client, &mut server);
        assert!(have.is_empty());
        assert_eq!(need.len(), 2);
    }

    #[test]
    fn frame_budget_defers_remainder_and_still_terminates() {
        let full: Vec<(u32, u8)> = (1u32..=64).map(|ts| (ts * 10, ts as u8)).collect();
        let client_storage = storage_of(&full);
        let server_storage = storage_of(&full);

        // A tiny frame budget forces multiple rounds via the pending
        // carry-over path even though both sides hold identical data.
        let mut client = ClientReconciler::new(&client_storage, 64);
        let mut server = ServerReconciler::new(&server_storage, 64);

        let (have, need) = drive(&mut client, &mut server);
        assert!(have.is_empty());
        assert!(need.is_empty());
    }
}
