//! # Circuit Engine
//!
//! Single-segment compartmental simulation engine.
//!
//! The engine accepts the primitives a circuit assembler needs:
//!
//! - **Sections**: cable segments (soma, dendrites) with geometry and
//!   inserted density mechanisms
//! - **Synapses**: dual-exponential point processes at a section position
//! - **Links**: threshold-triggered (voltage source to synapse) and
//!   event-driven (generator to synapse), with delay and weight
//! - **Generators**: one-shot or continuous-Poisson event sources
//! - **Clamps**: fixed-duration current injection
//! - **Recorders**: synchronized time/voltage vectors
//! - **Watchers**: spike detectors recording (time, gid) into a raster
//!
//! Control pair: `initialize(v)` then `run_to(tstop)`. Integration is
//! exponential Euler at a fixed timestep, so a recorder attached before
//! `initialize` holds exactly `tstop/dt + 1` samples after the run.
//!
//! Each section is a single segment: the position argument of point
//! processes and recorders is kept for addressing but does not subdivide
//! the cable.

use circuit_core::{CircuitError, Gid, Result, SpikeRaster, StateVector, Time, TimeSeries, Voltage};
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Default integration timestep (ms)
pub const DEFAULT_DT: Time = 0.025;

/// Membrane capacitance (uF/cm^2)
const CM: f64 = 1.0;

// =============================================================================
// ARENA IDENTIFIERS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectionId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SynapseId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GeneratorId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecorderId(pub usize);

// =============================================================================
// MODEL OBJECTS
// =============================================================================

/// Density mechanisms insertable into a section
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    /// Hodgkin-Huxley Na/K/leak
    Hh,
    /// Low-threshold (T-type) calcium current
    CaT,
}

/// A cable segment with geometry and inserted mechanisms
#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    /// Length (um)
    pub length: f64,
    /// Diameter (um)
    pub diam: f64,
    pub mechanisms: Vec<Mechanism>,
    /// Parent section and attachment position
    pub parent: Option<(SectionId, f64)>,
}

impl Section {
    /// Surface area (cm^2)
    fn area(&self) -> f64 {
        std::f64::consts::PI * self.diam * self.length * 1e-8 // um^2 to cm^2
    }

    fn has(&self, mech: Mechanism) -> bool {
        self.mechanisms.contains(&mech)
    }
}

/// Dual-exponential synapse kinetics
#[derive(Debug, Clone, Copy)]
pub struct SynapseKinetics {
    /// Rise time constant (ms)
    pub tau_rise: f64,
    /// Decay time constant (ms)
    pub tau_decay: f64,
    /// Reversal potential (mV)
    pub reversal: Voltage,
}

#[derive(Debug, Clone)]
struct Synapse {
    section: SectionId,
    #[allow(dead_code)]
    position: f64,
    kinetics: SynapseKinetics,
    /// Normalization so a unit-weight event peaks at 1 uS
    factor: f64,
    /// Rise state (uS)
    a: f64,
    /// Decay state (uS)
    b: f64,
}

impl Synapse {
    fn conductance(&self) -> f64 {
        self.b - self.a
    }
}

/// Fixed-duration current injection
#[derive(Debug, Clone)]
struct Clamp {
    section: SectionId,
    #[allow(dead_code)]
    position: f64,
    /// Onset (ms)
    delay: Time,
    /// Duration (ms)
    duration: Time,
    /// Amplitude (nA)
    amplitude: f64,
}

/// Event source: one-shot or continuous stochastic-interval train
#[derive(Debug, Clone)]
struct Generator {
    /// Mean inter-event interval (ms)
    interval: Time,
    /// Event budget; `None` is unbounded
    count: Option<u64>,
    /// First event no earlier than this (ms)
    start: Time,
    /// Exponentially distributed intervals when set
    noisy: bool,
    /// Next event time; infinity once exhausted
    next: Time,
    emitted: u64,
}

/// Generator-driven link to a synapse
#[derive(Debug, Clone)]
struct EventLink {
    generator: GeneratorId,
    target: SynapseId,
    delay: Time,
    weight: f64,
}

/// Voltage-threshold-triggered link to a synapse
#[derive(Debug, Clone)]
struct SpikeLink {
    source: SectionId,
    target: SynapseId,
    delay: Time,
    weight: f64,
    threshold: Voltage,
}

/// Spike detector feeding the shared raster
#[derive(Debug, Clone)]
struct Watcher {
    section: SectionId,
    threshold: Voltage,
    gid: Gid,
}

#[derive(Debug, Clone)]
struct Recorder {
    section: SectionId,
    #[allow(dead_code)]
    position: f64,
    series: TimeSeries,
}

/// Pending synaptic event, ordered earliest-first in the heap
#[derive(Debug)]
struct Delivery {
    time: Time,
    synapse: usize,
    weight: f64,
}

impl PartialEq for Delivery {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Delivery {}

impl PartialOrd for Delivery {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delivery {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, we pop the earliest time
        other
            .time
            .total_cmp(&self.time)
            .then_with(|| other.synapse.cmp(&self.synapse))
    }
}

// =============================================================================
// MEMBRANE STATE
// =============================================================================

/// Per-section integration state, built at `initialize`
#[derive(Debug, Clone)]
struct MembraneState {
    v: StateVector,
    /// HH gates
    m: StateVector,
    h: StateVector,
    n: StateVector,
    /// T-type calcium gates
    tm: StateVector,
    th: StateVector,
}

// =============================================================================
// ENGINE
// =============================================================================

/// Simulation engine: exclusive per-request global time and state
pub struct Engine {
    /// Timestep (ms)
    pub dt: Time,
    /// Current time (ms)
    t: Time,
    rng: StdRng,
    sections: Vec<Section>,
    synapses: Vec<Synapse>,
    clamps: Vec<Clamp>,
    generators: Vec<Generator>,
    event_links: Vec<EventLink>,
    spike_links: Vec<SpikeLink>,
    watchers: Vec<Watcher>,
    recorders: Vec<Recorder>,
    raster: SpikeRaster,
    pending: BinaryHeap<Delivery>,
    state: Option<MembraneState>,
    prev_v: Vec<Voltage>,
    areas: Vec<f64>,
    delivered: usize,
}

impl Engine {
    pub fn new(dt: Time) -> Self {
        Self::with_rng(dt, StdRng::from_entropy())
    }

    /// Deterministic engine for reproducible event trains
    pub fn with_seed(dt: Time, seed: u64) -> Self {
        Self::with_rng(dt, StdRng::seed_from_u64(seed))
    }

    fn with_rng(dt: Time, rng: StdRng) -> Self {
        Self {
            dt,
            t: 0.0,
            rng,
            sections: Vec::new(),
            synapses: Vec::new(),
            clamps: Vec::new(),
            generators: Vec::new(),
            event_links: Vec::new(),
            spike_links: Vec::new(),
            watchers: Vec::new(),
            recorders: Vec::new(),
            raster: SpikeRaster::new(),
            pending: BinaryHeap::new(),
            state: None,
            prev_v: Vec::new(),
            areas: Vec::new(),
            delivered: 0,
        }
    }

    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    pub fn add_section(&mut self, name: &str, length: f64, diam: f64) -> SectionId {
        self.sections.push(Section {
            name: name.to_string(),
            length,
            diam,
            mechanisms: Vec::new(),
            parent: None,
        });
        SectionId(self.sections.len() - 1)
    }

    pub fn insert(&mut self, section: SectionId, mech: Mechanism) {
        let sec = &mut self.sections[section.0];
        if !sec.has(mech) {
            sec.mechanisms.push(mech);
        }
    }

    /// Attach `child` to `parent` at the given parent position
    pub fn attach(&mut self, child: SectionId, parent: SectionId, parent_pos: f64) {
        self.sections[child.0].parent = Some((parent, parent_pos));
    }

    pub fn add_synapse(
        &mut self,
        section: SectionId,
        position: f64,
        kinetics: SynapseKinetics,
    ) -> Result<SynapseId> {
        let (t1, t2) = (kinetics.tau_rise, kinetics.tau_decay);
        if t1 <= 0.0 || t2 <= 0.0 || t1 == t2 {
            return Err(CircuitError::InvalidConfiguration(format!(
                "synapse time constants must be positive and distinct, got rise {t1} ms, decay {t2} ms"
            )));
        }
        // Exp2Syn normalization: peak conductance of a unit event is 1
        let tp = t1 * t2 / (t2 - t1) * (t2 / t1).ln();
        let factor = 1.0 / ((-tp / t2).exp() - (-tp / t1).exp());
        self.synapses.push(Synapse {
            section,
            position,
            kinetics,
            factor,
            a: 0.0,
            b: 0.0,
        });
        Ok(SynapseId(self.synapses.len() - 1))
    }

    pub fn add_clamp(
        &mut self,
        section: SectionId,
        position: f64,
        delay: Time,
        duration: Time,
        amplitude: f64,
    ) {
        self.clamps.push(Clamp {
            section,
            position,
            delay,
            duration,
            amplitude,
        });
    }

    pub fn add_generator(
        &mut self,
        interval: Time,
        count: Option<u64>,
        start: Time,
        noisy: bool,
    ) -> GeneratorId {
        self.generators.push(Generator {
            interval,
            count,
            start,
            noisy,
            next: start,
            emitted: 0,
        });
        GeneratorId(self.generators.len() - 1)
    }

    pub fn link_event(&mut self, generator: GeneratorId, target: SynapseId, delay: Time, weight: f64) {
        self.event_links.push(EventLink {
            generator,
            target,
            delay,
            weight,
        });
    }

    pub fn link_spike(
        &mut self,
        source: SectionId,
        target: SynapseId,
        delay: Time,
        weight: f64,
        threshold: Voltage,
    ) {
        self.spike_links.push(SpikeLink {
            source,
            target,
            delay,
            weight,
            threshold,
        });
    }

    pub fn watch_spikes(&mut self, section: SectionId, threshold: Voltage, gid: Gid) {
        self.watchers.push(Watcher {
            section,
            threshold,
            gid,
        });
    }

    pub fn record(&mut self, section: SectionId, position: f64) -> RecorderId {
        let name = format!("{}({:.2}).v", self.sections[section.0].name, position);
        self.recorders.push(Recorder {
            section,
            position,
            series: TimeSeries::new(&name),
        });
        RecorderId(self.recorders.len() - 1)
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    pub fn time(&self) -> Time {
        self.t
    }

    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    pub fn synapse_count(&self) -> usize {
        self.synapses.len()
    }

    pub fn clamp_count(&self) -> usize {
        self.clamps.len()
    }

    pub fn generator_count(&self) -> usize {
        self.generators.len()
    }

    pub fn event_link_count(&self) -> usize {
        self.event_links.len()
    }

    pub fn spike_link_count(&self) -> usize {
        self.spike_links.len()
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }

    pub fn recorder_count(&self) -> usize {
        self.recorders.len()
    }

    pub fn section_mechanisms(&self, section: SectionId) -> &[Mechanism] {
        &self.sections[section.0].mechanisms
    }

    /// Gids of all spike watchers, in attachment order
    pub fn watched_gids(&self) -> Vec<Gid> {
        self.watchers.iter().map(|w| w.gid).collect()
    }

    /// Synaptic events delivered so far in this run
    pub fn delivered_events(&self) -> usize {
        self.delivered
    }

    pub fn raster(&self) -> &SpikeRaster {
        &self.raster
    }

    /// Recorded time/voltage vectors (equal length, synchronized)
    pub fn recorded(&self, id: RecorderId) -> &TimeSeries {
        &self.recorders[id.0].series
    }

    // -------------------------------------------------------------------------
    // Control
    // -------------------------------------------------------------------------

    /// Reset time to zero, set every section to `v_init` with gates at
    /// steady state, clear recordings, and prime event generators.
    pub fn initialize(&mut self, v_init: Voltage) {
        self.t = 0.0;
        self.delivered = 0;
        self.pending.clear();
        self.raster.clear();

        let n = self.sections.len();
        self.areas = self.sections.iter().map(Section::area).collect();

        let v = Array1::from_elem(n, v_init);
        let mut state = MembraneState {
            v,
            m: Array1::zeros(n),
            h: Array1::zeros(n),
            n: Array1::zeros(n),
            tm: Array1::zeros(n),
            th: Array1::zeros(n),
        };
        let (m_inf, _) = hh_gate(v_init, hh_alpha_m, hh_beta_m);
        let (h_inf, _) = hh_gate(v_init, hh_alpha_h, hh_beta_h);
        let (n_inf, _) = hh_gate(v_init, hh_alpha_n, hh_beta_n);
        state.m.fill(m_inf);
        state.h.fill(h_inf);
        state.n.fill(n_inf);
        state.tm.fill(cat_minf(v_init));
        state.th.fill(cat_hinf(v_init));
        self.prev_v = vec![v_init; n];
        self.state = Some(state);

        for syn in &mut self.synapses {
            syn.a = 0.0;
            syn.b = 0.0;
        }

        for gen in &mut self.generators {
            gen.emitted = 0;
            gen.next = gen.start;
        }

        for rec in &mut self.recorders {
            rec.series.time.clear();
            rec.series.values.clear();
        }
        // First sample at t = 0
        if let Some(state) = &self.state {
            for rec in &mut self.recorders {
                rec.series.push(0.0, state.v[rec.section.0]);
            }
        }
    }

    /// Advance to `tstop`. Requires a prior `initialize`.
    pub fn run_to(&mut self, tstop: Time) -> Result<()> {
        if self.state.is_none() {
            return Err(CircuitError::SimulationError(
                "run_to called before initialize".into(),
            ));
        }
        let steps = ((tstop - self.t) / self.dt).round() as i64;
        for _ in 0..steps.max(0) {
            self.step()?;
        }
        Ok(())
    }

    fn step(&mut self) -> Result<()> {
        let t_next = self.t + self.dt;

        self.fire_generators(t_next);
        self.deliver_events(t_next);
        self.integrate(t_next)?;
        self.detect_spikes(t_next);

        self.t = t_next;
        if let Some(state) = &self.state {
            for rec in &mut self.recorders {
                rec.series.push(t_next, state.v[rec.section.0]);
            }
            for (prev, now) in self.prev_v.iter_mut().zip(state.v.iter()) {
                *prev = *now;
            }
        }
        Ok(())
    }

    /// Emit generator events due in (t, t_next] and schedule deliveries
    fn fire_generators(&mut self, t_next: Time) {
        for gi in 0..self.generators.len() {
            loop {
                let (fire_at, noisy, interval) = {
                    let g = &self.generators[gi];
                    if g.next > t_next {
                        break;
                    }
                    if let Some(count) = g.count {
                        if g.emitted >= count {
                            break;
                        }
                    }
                    (g.next, g.noisy, g.interval)
                };
                for link in &self.event_links {
                    if link.generator.0 == gi {
                        self.pending.push(Delivery {
                            time: fire_at + link.delay,
                            synapse: link.target.0,
                            weight: link.weight,
                        });
                    }
                }
                let advance = if noisy {
                    let u: f64 = self.rng.gen();
                    (-interval * (1.0 - u).ln()).max(1e-6)
                } else {
                    interval
                };
                let g = &mut self.generators[gi];
                g.emitted += 1;
                g.next = fire_at + advance;
            }
        }
    }

    /// Apply pending synaptic events due by `t_next`
    fn deliver_events(&mut self, t_next: Time) {
        while self.pending.peek().is_some_and(|top| top.time <= t_next) {
            if let Some(d) = self.pending.pop() {
                let syn = &mut self.synapses[d.synapse];
                syn.a += d.weight * syn.factor;
                syn.b += d.weight * syn.factor;
                self.delivered += 1;
            }
        }
    }

    /// One exponential-Euler membrane step for every section
    fn integrate(&mut self, t_next: Time) -> Result<()> {
        let n = self.sections.len();

        // Aggregate point-process conductances (uS) and currents (nA)
        let mut g_pt = vec![0.0; n];
        let mut ge_pt = vec![0.0; n];
        let mut i_pt = vec![0.0; n];
        for syn in &self.synapses {
            let g = syn.conductance();
            g_pt[syn.section.0] += g;
            ge_pt[syn.section.0] += g * syn.kinetics.reversal;
        }
        for clamp in &self.clamps {
            if self.t >= clamp.delay && self.t < clamp.delay + clamp.duration {
                i_pt[clamp.section.0] += clamp.amplitude;
            }
        }

        let dt = self.dt;
        let state = match self.state.as_mut() {
            Some(state) => state,
            None => {
                return Err(CircuitError::SimulationError(
                    "integration step before initialize".into(),
                ))
            }
        };
        for i in 0..n {
            let sec = &self.sections[i];
            let v = state.v[i];
            let area = self.areas[i];

            // Density conductances (S/cm^2) and conductance-weighted reversals
            let mut g_sum = 0.0;
            let mut ge_sum = 0.0;

            if sec.has(Mechanism::Hh) {
                let (m_inf, m_tau) = hh_gate(v, hh_alpha_m, hh_beta_m);
                let (h_inf, h_tau) = hh_gate(v, hh_alpha_h, hh_beta_h);
                let (n_inf, n_tau) = hh_gate(v, hh_alpha_n, hh_beta_n);
                state.m[i] = m_inf + (state.m[i] - m_inf) * (-dt / m_tau).exp();
                state.h[i] = h_inf + (state.h[i] - h_inf) * (-dt / h_tau).exp();
                state.n[i] = n_inf + (state.n[i] - n_inf) * (-dt / n_tau).exp();

                let g_na = 0.12 * state.m[i].powi(3) * state.h[i];
                let g_k = 0.036 * state.n[i].powi(4);
                let g_l = 0.0003;
                g_sum += g_na + g_k + g_l;
                ge_sum += g_na * 50.0 + g_k * (-77.0) + g_l * (-54.3);
            }

            if sec.has(Mechanism::CaT) {
                let tm_inf = cat_minf(v);
                let th_inf = cat_hinf(v);
                state.tm[i] = tm_inf + (state.tm[i] - tm_inf) * (-dt / cat_taum(v)).exp();
                state.th[i] = th_inf + (state.th[i] - th_inf) * (-dt / cat_tauh(v)).exp();

                let g_t = 0.002 * state.tm[i].powi(2) * state.th[i];
                g_sum += g_t;
                ge_sum += g_t * 120.0;
            }

            // Point processes, converted to density (uS -> S, nA -> mA)
            g_sum += g_pt[i] * 1e-6 / area;
            ge_sum += ge_pt[i] * 1e-6 / area;
            let i_inj = i_pt[i] * 1e-6 / area;

            // dv/dt [mV/ms] = 1000 * (ge_sum + i_inj - g_sum * v) / CM
            let v_new = if g_sum > 0.0 {
                let v_inf = (ge_sum + i_inj) / g_sum;
                let rate = 1000.0 * g_sum / CM;
                v_inf + (v - v_inf) * (-dt * rate).exp()
            } else {
                v + dt * 1000.0 * i_inj / CM
            };
            if !v_new.is_finite() {
                return Err(CircuitError::NumericalError(format!(
                    "membrane potential diverged in section '{}' at t = {:.3} ms",
                    sec.name, t_next
                )));
            }
            state.v[i] = v_new;
        }

        // Exp2Syn state decay
        for syn in &mut self.synapses {
            syn.a *= (-dt / syn.kinetics.tau_rise).exp();
            syn.b *= (-dt / syn.kinetics.tau_decay).exp();
        }
        Ok(())
    }

    /// Upward threshold crossings: feed watchers and threshold links
    fn detect_spikes(&mut self, t_next: Time) {
        let Some(state) = &self.state else {
            return;
        };
        for w in &self.watchers {
            if crossed(self.prev_v[w.section.0], state.v[w.section.0], w.threshold) {
                self.raster.record(t_next, w.gid);
            }
        }
        for link in &self.spike_links {
            if crossed(
                self.prev_v[link.source.0],
                state.v[link.source.0],
                link.threshold,
            ) {
                self.pending.push(Delivery {
                    time: t_next + link.delay,
                    synapse: link.target.0,
                    weight: link.weight,
                });
            }
        }
    }
}

/// Upward crossing of `threshold` between consecutive samples
fn crossed(prev: Voltage, now: Voltage, threshold: Voltage) -> bool {
    prev < threshold && now >= threshold
}

// =============================================================================
// CHANNEL KINETICS
// =============================================================================

/// Singularity-safe linoid form: a * (v + b) / (exp((v + b) / c) - 1)
fn linoid(v: Voltage, a: f64, b: f64, c: f64) -> f64 {
    let x = (v + b) / c;
    if x.abs() < 1e-6 {
        a * c
    } else {
        a * (v + b) / (x.exp() - 1.0)
    }
}

fn hh_alpha_m(v: Voltage) -> f64 {
    linoid(v, 0.1, 40.0, -10.0) * -1.0
}

fn hh_beta_m(v: Voltage) -> f64 {
    4.0 * ((-(v + 65.0)) / 18.0).exp()
}

fn hh_alpha_h(v: Voltage) -> f64 {
    0.07 * ((-(v + 65.0)) / 20.0).exp()
}

fn hh_beta_h(v: Voltage) -> f64 {
    1.0 / (1.0 + ((-(v + 35.0)) / 10.0).exp())
}

fn hh_alpha_n(v: Voltage) -> f64 {
    linoid(v, 0.01, 55.0, -10.0) * -1.0
}

fn hh_beta_n(v: Voltage) -> f64 {
    0.125 * ((-(v + 65.0)) / 80.0).exp()
}

/// Steady state and time constant from alpha/beta rate functions
fn hh_gate(v: Voltage, alpha: fn(Voltage) -> f64, beta: fn(Voltage) -> f64) -> (f64, f64) {
    let a = alpha(v);
    let b = beta(v);
    (a / (a + b), 1.0 / (a + b))
}

fn cat_minf(v: Voltage) -> f64 {
    1.0 / (1.0 + (-(v + 57.0) / 6.2).exp())
}

fn cat_hinf(v: Voltage) -> f64 {
    1.0 / (1.0 + ((v + 81.0) / 4.0).exp())
}

fn cat_taum(v: Voltage) -> f64 {
    0.612 + 1.0 / ((-(v + 132.0) / 16.7).exp() + ((v + 16.8) / 18.2).exp())
}

fn cat_tauh(v: Voltage) -> f64 {
    if v < -80.0 {
        ((v + 467.0) / 66.6).exp()
    } else {
        28.0 + (-(v + 22.0) / 10.5).exp()
    }
}

// =============================================================================
// TESTS
// =============================================================================
