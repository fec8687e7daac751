//! Conservative time coordination.
//!
//! Every federate tracks, per dependency partner, the partner's advertised
//! emission floor `te` (the earliest time it may still emit an event) and
//! request floor `minde` (the earliest outstanding request in its upstream
//! closure). A request is granted once no dependency can emit at or before
//! the candidate time; equal-time candidates are granted when every
//! dependency's request floor has also reached the candidate, which lets
//! coupled federates cross the same time together.
//!
//! Advertised floors carry the federate that *grounds* them: a blocked
//! federate's floor may derive from a partner's floor, which may itself
//! derive from ours, and a receiver must not be constrained by an echo of
//! its own state looping through a dependency cycle. Floors grounded in an
//! actual queued event carry no origin and always constrain.

use std::time::Duration;

use conflux_core::flags::FederateFlags;
use conflux_core::{GlobalFederateId, IterationRequest, IterationResult, Time};

use crate::frame::TimingUpdate;

/// Time-related configuration of one federate.
#[derive(serde::Serialize, serde::Deserialize)]
#[derive(Debug, Clone)]
#[serde(default)]
pub struct TimeProperties {
    pub period: Time,
    pub offset: Time,
    /// Minimum interval between distinct granted times.
    pub time_delta: Time,
    pub input_delay: Time,
    pub output_delay: Time,
    /// Wall-clock bound on a blocked time request.
    pub grant_timeout: Option<Duration>,
    pub max_iterations: u32,
}

impl Default for TimeProperties {
    fn default() -> Self {
        Self {
            period: Time::ZERO,
            offset: Time::ZERO,
            time_delta: Time::EPSILON,
            input_delay: Time::ZERO,
            output_delay: Time::ZERO,
            grant_timeout: None,
            max_iterations: 50,
        }
    }
}

/// A time floor together with the federate grounding it. An invalid origin
/// means the floor is grounded in a real queued event and always binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Floor {
    time: Time,
    origin: GlobalFederateId,
}

impl Floor {
    const EVENT: GlobalFederateId = GlobalFederateId::INVALID;

    fn event(time: Time) -> Self {
        Self {
            time,
            origin: Self::EVENT,
        }
    }

    fn grounded(time: Time, origin: GlobalFederateId) -> Self {
        Self { time, origin }
    }

    /// Combine, keeping the smaller time. On ties prefer the grounding
    /// least likely to be discarded: events, then the preferred origin.
    fn merge(self, other: Floor, prefer: GlobalFederateId) -> Floor {
        if other.time < self.time {
            return other;
        }
        if other.time > self.time {
            return self;
        }
        // Equal floors: keep an event grounding, else prefer `prefer`.
        if self.origin == Self::EVENT || self.origin == prefer {
            self
        } else if other.origin == Self::EVENT || other.origin == prefer {
            other
        } else {
            self
        }
    }

    fn shifted(self, delay: Time) -> Floor {
        Floor {
            time: self.time + delay,
            origin: self.origin,
        }
    }
}

/// What a federate knows about one time-dependency partner.
#[derive(Debug, Clone)]
pub struct DependencyInfo {
    pub id: GlobalFederateId,
    /// The partner's events can affect us.
    pub dependency: bool,
    /// Our events can affect the partner.
    pub dependent: bool,
    /// Coupling delay on the partner→us edge (link delays plus our own
    /// input delay).
    pub delay: Time,
    /// The partner's advertised emission floor.
    pub te: Time,
    te_origin: GlobalFederateId,
    /// The partner's advertised request floor.
    pub minde: Time,
    minde_origin: GlobalFederateId,
    pub connected: bool,
}

impl DependencyInfo {
    fn new(id: GlobalFederateId) -> Self {
        // Until the partner advertises, its floor is unknown and grounded
        // in the partner itself, so the echo rule can release cycles.
        Self {
            id,
            dependency: false,
            dependent: false,
            delay: Time::ZERO,
            te: Time::MIN_VALUE,
            te_origin: id,
            minde: Time::MIN_VALUE,
            minde_origin: id,
            connected: true,
        }
    }

    fn blocking(&self) -> bool {
        self.dependency && self.connected
    }
}

/// Lifecycle of the coordinator itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoordState {
    /// Before the federation-wide executing grant.
    Created,
    /// Granted and processing the current time.
    Executing,
    /// A request is outstanding.
    Blocked {
        requested: Time,
        iterate: IterationRequest,
    },
    /// No further grants; advertisements are unbounded.
    Done,
}

/// Outcome of a grant evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantOutcome {
    Granted {
        time: Time,
        result: IterationResult,
        iteration: u32,
    },
    Waiting,
}

/// Per-federate conservative time coordinator.
#[derive(Debug)]
pub struct TimeCoordinator {
    id: GlobalFederateId,
    props: TimeProperties,
    flags: FederateFlags,
    state: CoordState,
    granted: Time,
    iteration: u32,
    deps: Vec<DependencyInfo>,
    last_sent: Option<TimingUpdate>,
}

impl TimeCoordinator {
    pub fn new(id: GlobalFederateId, props: TimeProperties, flags: FederateFlags) -> Self {
        Self {
            id,
            props,
            flags,
            state: CoordState::Created,
            granted: Time::MIN_VALUE,
            iteration: 0,
            deps: Vec::new(),
            last_sent: None,
        }
    }

    pub fn id(&self) -> GlobalFederateId {
        self.id
    }

    pub fn set_id(&mut self, id: GlobalFederateId) {
        self.id = id;
    }

    pub fn granted(&self) -> Time {
        self.granted
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn props(&self) -> &TimeProperties {
        &self.props
    }

    pub fn props_mut(&mut self) -> &mut TimeProperties {
        &mut self.props
    }

    pub fn set_flags(&mut self, flags: FederateFlags) {
        self.flags = flags;
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self.state, CoordState::Blocked { .. })
    }

    pub fn requested(&self) -> Option<Time> {
        match self.state {
            CoordState::Blocked { requested, .. } => Some(requested),
            _ => None,
        }
    }

    pub fn dependencies(&self) -> impl Iterator<Item = &DependencyInfo> {
        self.deps.iter()
    }

    fn partner_mut(&mut self, id: GlobalFederateId) -> &mut DependencyInfo {
        if let Some(at) = self.deps.iter().position(|d| d.id == id) {
            &mut self.deps[at]
        } else {
            self.deps.push(DependencyInfo::new(id));
            self.deps.last_mut().unwrap()
        }
    }

    /// Upsert an edge to `partner`; roles accumulate, delay is replaced.
    pub fn set_edge(
        &mut self,
        partner: GlobalFederateId,
        delay: Time,
        dependency: bool,
        dependent: bool,
    ) {
        let info = self.partner_mut(partner);
        info.dependency |= dependency;
        info.dependent |= dependent;
        info.delay = delay;
        info.connected = true;
    }

    /// Record a partner's advertisement. Returns true when anything changed.
    pub fn partner_update(&mut self, partner: GlobalFederateId, update: TimingUpdate) -> bool {
        let info = self.partner_mut(partner);
        let changed = info.te != update.te
            || info.minde != update.minde
            || info.te_origin != update.te_origin
            || info.minde_origin != update.minde_origin;
        info.te = update.te;
        info.te_origin = update.te_origin;
        info.minde = update.minde;
        info.minde_origin = update.minde_origin;
        changed
    }

    /// Drop a partner's constraint; its edges stop blocking us.
    pub fn partner_disconnected(&mut self, partner: GlobalFederateId) -> bool {
        if let Some(info) = self.deps.iter_mut().find(|d| d.id == partner) {
            let was = info.connected;
            info.connected = false;
            was
        } else {
            false
        }
    }

    /// Enter the executing state at the federation start time.
    pub fn enter_executing(&mut self, start: Time) {
        self.state = CoordState::Executing;
        self.granted = start;
        self.iteration = 0;
    }

    /// Post a time request; evaluation happens separately.
    pub fn request(&mut self, time: Time, iterate: IterationRequest) {
        let requested = self.quantize(time);
        self.state = CoordState::Blocked { requested, iterate };
    }

    /// Stop participating; advertisements become unbounded.
    pub fn finalize(&mut self) {
        self.state = CoordState::Done;
    }

    fn quantize(&self, t: Time) -> Time {
        if self.props.period <= Time::ZERO || t == Time::MAXIMUM {
            return t;
        }
        let base = self.props.offset;
        if t <= base {
            return base;
        }
        let span = (t - base).as_ns();
        let period = self.props.period.as_ns();
        let steps = (span + period - 1) / period;
        base + Time::from_ns(steps * period)
    }

    /// Emission and request floors over the blocking dependencies,
    /// discarding floors grounded in this federate's own state.
    fn barriers(&self) -> (Floor, Floor) {
        let mut te_floor = Floor::event(Time::MAXIMUM);
        let mut minde_floor = Floor::event(Time::MAXIMUM);
        for dep in self.deps.iter().filter(|d| d.blocking()) {
            if dep.te_origin != self.id {
                te_floor = te_floor.merge(
                    Floor::grounded(dep.te, dep.te_origin).shifted(dep.delay),
                    self.id,
                );
            }
            if dep.minde_origin != self.id {
                minde_floor = minde_floor.merge(
                    Floor::grounded(dep.minde, dep.minde_origin).shifted(dep.delay),
                    self.id,
                );
            }
        }
        (te_floor, minde_floor)
    }

    /// Evaluate the outstanding request against dependency state.
    ///
    /// `earliest_event` is the earliest pending local event later than the
    /// granted time; `updated_at_granted` reports whether any input changed
    /// at exactly the granted time since the last grant.
    pub fn evaluate(&mut self, earliest_event: Time, updated_at_granted: bool) -> GrantOutcome {
        let CoordState::Blocked { requested, iterate } = self.state else {
            return GrantOutcome::Waiting;
        };

        // Re-entry into the current time.
        if requested <= self.granted && self.granted > Time::MIN_VALUE {
            let iterating = match iterate {
                IterationRequest::ForceIteration => self.iteration < self.props.max_iterations,
                IterationRequest::IterateIfNeeded => {
                    updated_at_granted && self.iteration < self.props.max_iterations
                }
                IterationRequest::NoIteration => false,
            };
            let result = if iterating {
                self.iteration += 1;
                IterationResult::Iterating
            } else {
                IterationResult::NextStep
            };
            self.state = CoordState::Executing;
            return GrantOutcome::Granted {
                time: self.granted,
                result,
                iteration: self.iteration,
            };
        }

        let event_floor = if self.flags.uninterruptible {
            Time::MAXIMUM
        } else {
            earliest_event
        };
        let candidate = requested.min(event_floor).max(self.granted);
        let (te_floor, minde_floor) = self.barriers();

        let allowed = if self.flags.restrictive_time_policy {
            candidate < te_floor.time && candidate <= minde_floor.time
        } else if self.flags.wait_for_current_time_update {
            candidate < te_floor.time
        } else {
            candidate < te_floor.time
                || (candidate == te_floor.time && candidate <= minde_floor.time)
        };

        if !allowed {
            return GrantOutcome::Waiting;
        }

        self.granted = candidate;
        self.iteration = 0;
        self.state = CoordState::Executing;
        GrantOutcome::Granted {
            time: candidate,
            result: IterationResult::NextStep,
            iteration: 0,
        }
    }

    /// The floors this federate exposes to its dependents.
    fn advert(&self, earliest_event: Time) -> TimingUpdate {
        let (te, minde) = match self.state {
            CoordState::Created => (
                Floor::grounded(Time::ZERO, self.id),
                Floor::grounded(Time::ZERO, self.id),
            ),
            CoordState::Executing => (
                Floor::grounded(self.granted + self.props.output_delay, self.id),
                Floor::grounded(self.granted, self.id),
            ),
            CoordState::Blocked { requested, .. } => {
                let event_floor = if self.flags.uninterruptible {
                    Time::MAXIMUM
                } else {
                    earliest_event
                };
                let (te_barrier, minde_barrier) = self.barriers();
                // The earliest this federate could still be granted, and so
                // emit: its own request, a queued event, or a wake-up from
                // a dependency.
                let te = Floor::grounded(requested, self.id)
                    .merge(Floor::event(event_floor), self.id)
                    .merge(te_barrier, self.id);
                let minde = Floor::grounded(requested, self.id)
                    .merge(Floor::event(event_floor), self.id)
                    .merge(minde_barrier, self.id);
                (
                    Floor {
                        time: te.time.max(self.granted) + self.props.output_delay,
                        origin: te.origin,
                    },
                    Floor {
                        time: minde.time.max(self.granted),
                        origin: minde.origin,
                    },
                )
            }
            CoordState::Done => (
                Floor::grounded(Time::MAXIMUM, self.id),
                Floor::grounded(Time::MAXIMUM, self.id),
            ),
        };
        TimingUpdate {
            te: te.time,
            te_origin: te.origin,
            minde: minde.time,
            minde_origin: minde.origin,
        }
    }

    /// When the advertisement changed since it was last pushed, the set of
    /// connected dependents to push it to.
    pub fn pending_adverts(
        &mut self,
        earliest_event: Time,
    ) -> Vec<(GlobalFederateId, TimingUpdate)> {
        let update = self.advert(earliest_event);
        if self.last_sent.as_ref() == Some(&update) {
            return Vec::new();
        }
        self.last_sent = Some(update);
        self.deps
            .iter()
            .filter(|d| d.dependent && d.connected)
            .map(|d| (d.id, update))
            .collect()
    }
}
