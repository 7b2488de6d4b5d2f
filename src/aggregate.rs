//! Temporal aggregation of detector signals into persistent incidents.
//!
//! Each signal kind runs an independent state machine:
//!
//! ```text
//! idle -> arming -> active -> cooling -> idle
//! ```
//!
//! A trip must hold continuously for the sustain window before an incident
//! opens (debounce); a cleared trip keeps the incident warm through the
//! grouping window so a flickering condition reopens the same incident with
//! an incremented count instead of spawning a new row per flicker. All
//! timing derives from frame timestamps, the pipeline's single clock source.

use serde::Serialize;
use std::collections::VecDeque;

use crate::detect::{DetectionSignal, SignalAux, SignalKind};
use crate::IncidentKind;

/// Default sustain window before an incident opens.
const SUSTAIN_S: f64 = 2.0;
/// Sustain window for a fast-path reposition trip.
const FAST_REPOSITION_SUSTAIN_S: f64 = 1.0;
/// Re-trips within this window of the last active frame regroup into the
/// same incident; past it the incident closes.
const GROUPING_WINDOW_S: f64 = 5.0;
/// In-memory retention cap; older incidents live only in storage.
const RETAINED_INCIDENTS: usize = 5;

/// A persistent interference incident.
#[derive(Clone, Debug, Serialize)]
pub struct Incident {
    pub id: u64,
    pub kind: IncidentKind,
    pub subtype: String,
    pub first_seen_ts: f64,
    pub last_seen_ts: f64,
    pub count: u32,
    pub description: String,
}

/// Lifecycle notifications pushed to the sink and the persistence layer.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "snake_case", tag = "transition")]
pub enum IncidentTransition {
    Opened(Incident),
    Updated(Incident),
    Closed(Incident),
}

impl IncidentTransition {
    pub fn incident(&self) -> &Incident {
        match self {
            IncidentTransition::Opened(i)
            | IncidentTransition::Updated(i)
            | IncidentTransition::Closed(i) => i,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum AlertState {
    Idle,
    Arming { since: f64 },
    Active,
    Cooling { since: f64 },
}

struct KindState {
    kind: SignalKind,
    state: AlertState,
    incident: Option<Incident>,
}

pub struct Aggregator {
    kinds: Vec<KindState>,
    recent: VecDeque<Incident>,
    next_id: u64,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::with_start_id(1)
    }

    /// Start incident ids from `first_id`, typically one past the highest id
    /// already in storage so ids stay unique across restarts.
    pub fn with_start_id(first_id: u64) -> Self {
        Self {
            kinds: SignalKind::ALL
                .iter()
                .map(|&kind| KindState {
                    kind,
                    state: AlertState::Idle,
                    incident: None,
                })
                .collect(),
            recent: VecDeque::with_capacity(RETAINED_INCIDENTS),
            next_id: first_id.max(1),
        }
    }

    /// Advance every state machine with this frame's signals.
    pub fn observe(&mut self, signals: &[DetectionSignal], now_s: f64) -> Vec<IncidentTransition> {
        let mut transitions = Vec::new();
        for signal in signals {
            if let Some(t) = self.observe_one(signal, now_s) {
                transitions.push(t);
            }
        }
        transitions
    }

    fn observe_one(&mut self, signal: &DetectionSignal, now_s: f64) -> Option<IncidentTransition> {
        let sustain = sustain_window(signal);
        let slot = self
            .kinds
            .iter_mut()
            .find(|k| k.kind == signal.kind)
            .expect("all signal kinds registered");

        match slot.state {
            AlertState::Idle => {
                if signal.tripped {
                    slot.state = AlertState::Arming { since: now_s };
                }
                None
            }
            AlertState::Arming { since } => {
                if !signal.tripped {
                    slot.state = AlertState::Idle;
                    return None;
                }
                if now_s - since >= sustain {
                    return Self::open(slot, signal, since, &mut self.next_id, &mut self.recent);
                }
                None
            }
            AlertState::Active => {
                if signal.tripped {
                    let incident = slot.incident.as_mut().expect("active implies incident");
                    incident.last_seen_ts = now_s;
                    let snapshot = incident.clone();
                    Self::refresh_recent(&mut self.recent, &snapshot);
                    Some(IncidentTransition::Updated(snapshot))
                } else {
                    slot.state = AlertState::Cooling { since: now_s };
                    None
                }
            }
            AlertState::Cooling { since } => {
                if signal.tripped && now_s - since <= GROUPING_WINDOW_S {
                    slot.state = AlertState::Active;
                    let incident = slot.incident.as_mut().expect("cooling implies incident");
                    incident.count += 1;
                    incident.last_seen_ts = now_s;
                    let snapshot = incident.clone();
                    Self::refresh_recent(&mut self.recent, &snapshot);
                    Some(IncidentTransition::Updated(snapshot))
                } else if now_s - since > GROUPING_WINDOW_S {
                    slot.state = AlertState::Idle;
                    let incident = slot.incident.take().expect("cooling implies incident");
                    // A trip arriving exactly as the window lapses starts a
                    // fresh cycle on the next frame.
                    Some(IncidentTransition::Closed(incident))
                } else {
                    None
                }
            }
        }
    }

    fn open(
        slot: &mut KindState,
        signal: &DetectionSignal,
        first_seen: f64,
        next_id: &mut u64,
        recent: &mut VecDeque<Incident>,
    ) -> Option<IncidentTransition> {
        let incident = Incident {
            id: *next_id,
            kind: signal.kind.into(),
            subtype: subtype_of(signal),
            first_seen_ts: first_seen,
            last_seen_ts: first_seen,
            count: 1,
            description: describe(signal),
        };
        *next_id += 1;
        slot.state = AlertState::Active;
        slot.incident = Some(incident.clone());

        if recent.len() == RETAINED_INCIDENTS {
            recent.pop_front();
        }
        recent.push_back(incident.clone());

        Some(IncidentTransition::Opened(incident))
    }

    fn refresh_recent(recent: &mut VecDeque<Incident>, snapshot: &Incident) {
        if let Some(entry) = recent.iter_mut().find(|i| i.id == snapshot.id) {
            *entry = snapshot.clone();
        }
    }

    /// Claim the next incident id. Used for incidents raised outside the
    /// signal state machines (capture loss).
    pub fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// The most recent incidents still held in memory (at most 5).
    pub fn recent(&self) -> impl Iterator<Item = &Incident> {
        self.recent.iter()
    }

    /// Is an incident of this kind currently open (active or cooling)?
    pub fn is_open(&self, kind: SignalKind) -> bool {
        self.kinds
            .iter()
            .find(|k| k.kind == kind)
            .map(|k| k.incident.is_some())
            .unwrap_or(false)
    }

    /// Force a kind back to idle, closing any open incident. Used when the
    /// operator acknowledges a reposition alert.
    pub fn dismiss(&mut self, kind: SignalKind) -> Option<IncidentTransition> {
        let slot = self.kinds.iter_mut().find(|k| k.kind == kind)?;
        slot.state = AlertState::Idle;
        slot.incident.take().map(IncidentTransition::Closed)
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

fn sustain_window(signal: &DetectionSignal) -> f64 {
    match &signal.aux {
        SignalAux::Reposition { fast_path: true, .. } => FAST_REPOSITION_SUSTAIN_S,
        _ => SUSTAIN_S,
    }
}

fn subtype_of(signal: &DetectionSignal) -> String {
    match &signal.aux {
        SignalAux::Reposition { fast_path, .. } => {
            if *fast_path { "fast" } else { "slow" }.to_string()
        }
        _ => String::new(),
    }
}

fn describe(signal: &DetectionSignal) -> String {
    match &signal.aux {
        SignalAux::Blur { variance } => {
            format!("lens obscured: laplacian variance {variance:.1}")
        }
        SignalAux::Glare {
            bright_pct,
            dark_pct,
            ..
        } => format!(
            "glare washout: bright {bright_pct:.1}%, dark {dark_pct:.1}%"
        ),
        SignalAux::Shake { magnitude } => {
            format!("camera shake: mean motion {magnitude:.1} px")
        }
        SignalAux::Reposition {
            magnitude,
            direction,
            ..
        } => match direction {
            Some(dir) => format!("camera repositioned {dir}: shift {magnitude:.1} px"),
            None => format!("camera repositioned: shift {magnitude:.1} px"),
        },
        SignalAux::Liveness { diff, brightness } => match signal.kind {
            SignalKind::Blackout => format!("feed blackout: brightness {brightness:.1}"),
            SignalKind::MajorTamper => format!("scene replaced: frame diff {diff:.1}"),
            _ => format!("feed frozen: frame diff {diff:.2}"),
        },
        SignalAux::None => signal.kind.as_str().to_string(),
    }
}
