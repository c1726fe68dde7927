//! # Circuit Assembly
//!
//! Turns a declarative circuit description into concrete engine objects and
//! collects the recorded results after the run.
//!
//! Two description styles share the same leaves (morphology compiler and
//! synapse/stimulus factory):
//!
//! 1. **Individual mode**: explicit neurons, connections, stimulators and
//!    probes resolved by identifier.
//! 2. **Probabilistic mode**: populations instantiated from statistical
//!    rules - Bernoulli connectivity over population cross-products,
//!    full-coverage noisy background or percentage-sampled stimulation,
//!    probe subset sampling - with dense global identifiers keying spike
//!    recording.
//!
//! Resolution is best-effort: an entity referencing an unknown identifier is
//! skipped with a diagnostic and assembly continues. Malformed geometry or
//! out-of-range probabilities abort the whole request before any engine
//! object exists.

use circuit_core::{CircuitError, Gid, Result};
use circuit_engine::{
    Engine, Mechanism, RecorderId, SectionId, SynapseKinetics, DEFAULT_DT,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Spike detection and connection trigger threshold (mV)
pub const SPIKE_THRESHOLD: f64 = -20.0;

/// Current clamp duration is pinned, amplitude comes from the weight (ms)
const ICLAMP_DURATION: f64 = 100.0;

/// Mean interval of the noisy background driver (ms)
const NOISY_INTERVAL: f64 = 100.0;

/// Generator-to-synapse delivery delay (ms)
const EVENT_LINK_DELAY: f64 = 1.0;

/// Populations with these display names get the low-threshold calcium
/// mechanism in addition to `hh` (thalamocortical convention)
const THALAMIC_BURSTERS: [&str; 2] = ["TC", "RE"];

// =============================================================================
// REQUEST DATA MODEL
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Individual,
    Probabilistic,
}

/// Compartment labels as they appear on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CompartmentKind {
    #[default]
    #[serde(rename = "Soma")]
    Soma,
    #[serde(rename = "Apical Dendrite")]
    Apical,
    #[serde(rename = "Basal Dendrite")]
    Basal,
}

impl CompartmentKind {
    /// First word of the label, used in trace labels
    pub fn base(&self) -> &'static str {
        match self {
            Self::Soma => "Soma",
            Self::Apical => "Apical",
            Self::Basal => "Basal",
        }
    }
}

impl fmt::Display for CompartmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Soma => write!(f, "Soma"),
            Self::Apical => write!(f, "Apical Dendrite"),
            Self::Basal => write!(f, "Basal Dendrite"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SynapseKind {
    #[serde(rename = "AMPA")]
    Ampa,
    #[serde(rename = "GABA")]
    Gaba,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StimKind {
    #[serde(rename = "IClamp")]
    IClamp,
    #[serde(rename = "AMPA")]
    Ampa,
    #[serde(rename = "GABA")]
    Gaba,
}

/// Per-neuron or per-population geometry template
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MorphologySpec {
    pub soma_diam: f64,
    #[serde(default)]
    pub include_apical: bool,
    #[serde(default)]
    pub include_basal: bool,
    #[serde(default)]
    pub apical_l: Option<f64>,
    #[serde(default)]
    pub apical_diam: Option<f64>,
    #[serde(default)]
    pub basal_l: Option<f64>,
    #[serde(default)]
    pub basal_diam: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NeuronSpec {
    pub id: String,
    pub name: String,
    pub morphology: MorphologySpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSpec {
    pub source_id: String,
    pub target_id: String,
    #[serde(default)]
    pub target_section: CompartmentKind,
    #[serde(default = "default_position")]
    pub position: f64,
    pub synapse_type: SynapseKind,
    pub delay: f64,
    pub weight: f64,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StimulatorSpec {
    pub target_id: String,
    pub stim_type: StimKind,
    #[serde(default)]
    pub target_section: CompartmentKind,
    #[serde(default = "default_position")]
    pub position: f64,
    #[serde(default)]
    pub delay: f64,
    pub weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeSpec {
    pub id: String,
    pub target_id: String,
    pub section: CompartmentKind,
    #[serde(default = "default_position")]
    pub position: f64,
    pub color: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PopulationSpec {
    pub id: String,
    pub name: String,
    pub quantity: usize,
    pub morphology: MorphologySpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStrategy {
    pub source_pop_id: String,
    pub target_pop_id: String,
    #[serde(default)]
    pub target_section: CompartmentKind,
    pub synapse_type: SynapseKind,
    pub probability: f64,
    pub delay: f64,
    pub weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StimulationStrategy {
    pub target_pop_id: String,
    pub stim_type: StimKind,
    #[serde(default)]
    pub is_noisy: bool,
    #[serde(default = "default_percentage")]
    pub percentage: f64,
    #[serde(default)]
    pub target_section: CompartmentKind,
    #[serde(default = "default_position")]
    pub position: f64,
    #[serde(default)]
    pub delay: f64,
    pub weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbabilisticProbe {
    pub id: String,
    pub target_pop_id: String,
    #[serde(default)]
    pub section: CompartmentKind,
    #[serde(default = "default_position")]
    pub position: f64,
    #[serde(default = "default_count")]
    pub count: usize,
    pub color: String,
}

/// One build-and-run request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationRequest {
    #[serde(default)]
    pub mode: Mode,
    #[serde(default = "default_tstop")]
    pub tstop: f64,

    // Individual mode
    #[serde(default)]
    pub neurons: Vec<NeuronSpec>,
    #[serde(default)]
    pub connections: Vec<ConnectionSpec>,
    #[serde(default)]
    pub stimulators: Vec<StimulatorSpec>,
    #[serde(default)]
    pub probes: Vec<ProbeSpec>,

    // Probabilistic mode
    #[serde(default)]
    pub populations: Vec<PopulationSpec>,
    #[serde(default)]
    pub connection_strategies: Vec<ConnectionStrategy>,
    #[serde(default)]
    pub stimulation_strategies: Vec<StimulationStrategy>,
    #[serde(default)]
    pub probabilistic_probes: Vec<ProbabilisticProbe>,
}

fn default_position() -> f64 {
    0.5
}

fn default_threshold() -> f64 {
    SPIKE_THRESHOLD
}

fn default_percentage() -> f64 {
    100.0
}

fn default_count() -> usize {
    1
}

fn default_tstop() -> f64 {
    1000.0
}

// =============================================================================
// RESPONSE DATA MODEL
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceData {
    pub label: String,
    pub color: String,
    pub time: Vec<f64>,
    pub voltage: Vec<f64>,
}

/// One raster point: spike time and global neuron identifier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpikePoint {
    pub x: f64,
    pub y: Gid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationResponse {
    pub traces: Vec<TraceData>,
    /// Present only in probabilistic mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spike_data: Option<Vec<SpikePoint>>,
}

// =============================================================================
// DIAGNOSTICS
// =============================================================================

/// Structured channel for best-effort skips. The serialized response never
/// carries these; callers decide whether to surface them.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Diagnostics {
    pub warnings: Vec<String>,
}

impl Diagnostics {
    pub fn unresolved(&mut self, entity: &str, reference: &str) {
        tracing::warn!(
            entity = %entity,
            reference = %reference,
            "skipping entity with unresolved reference"
        );
        self.warnings
            .push(format!("{entity} references unknown id '{reference}', skipped"));
    }

    pub fn missing_compartment(&mut self, entity: &str, id: &str, section: CompartmentKind) {
        tracing::warn!(
            entity = %entity,
            id = %id,
            section = %section,
            "skipping entity addressing a missing compartment"
        );
        self.warnings.push(format!(
            "{entity} '{id}' addresses missing compartment '{section}', skipped"
        ));
    }

    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Explicit run configuration; a fixed seed makes sampling reproducible
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Integration timestep (ms)
    pub dt: f64,
    /// Initialization voltage (mV)
    pub v_init: f64,
    pub seed: Option<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            dt: DEFAULT_DT,
            v_init: -65.0,
            seed: None,
        }
    }
}

// =============================================================================
// VALIDATION
// =============================================================================

fn invalid(msg: String) -> CircuitError {
    CircuitError::InvalidConfiguration(msg)
}

fn check_positive(ctx: &str, field: &str, value: f64) -> Result<()> {
    if value > 0.0 {
        Ok(())
    } else {
        Err(invalid(format!("{ctx}: {field} must be positive, got {value}")))
    }
}

fn check_unit_range(ctx: &str, field: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(format!("{ctx}: {field} must lie in [0, 1], got {value}")))
    }
}

fn check_morphology(ctx: &str, morpho: &MorphologySpec) -> Result<()> {
    check_positive(ctx, "somaDiam", morpho.soma_diam)?;
    if morpho.include_apical {
        let l = morpho
            .apical_l
            .ok_or_else(|| invalid(format!("{ctx}: apicalL required when includeApical is set")))?;
        let d = morpho
            .apical_diam
            .ok_or_else(|| invalid(format!("{ctx}: apicalDiam required when includeApical is set")))?;
        check_positive(ctx, "apicalL", l)?;
        check_positive(ctx, "apicalDiam", d)?;
    }
    if morpho.include_basal {
        let l = morpho
            .basal_l
            .ok_or_else(|| invalid(format!("{ctx}: basalL required when includeBasal is set")))?;
        let d = morpho
            .basal_diam
            .ok_or_else(|| invalid(format!("{ctx}: basalDiam required when includeBasal is set")))?;
        check_positive(ctx, "basalL", l)?;
        check_positive(ctx, "basalDiam", d)?;
    }
    Ok(())
}

/// Whole-request validation; runs before any engine object is created
pub fn validate(req: &SimulationRequest) -> Result<()> {
    check_positive("request", "tstop", req.tstop)?;

    match req.mode {
        Mode::Individual => {
            for neuron in &req.neurons {
                check_morphology(&format!("neuron '{}'", neuron.id), &neuron.morphology)?;
            }
            for conn in &req.connections {
                let ctx = format!("connection '{}' -> '{}'", conn.source_id, conn.target_id);
                check_unit_range(&ctx, "position", conn.position)?;
            }
            for stim in &req.stimulators {
                let ctx = format!("stimulator on '{}'", stim.target_id);
                check_unit_range(&ctx, "position", stim.position)?;
            }
            for probe in &req.probes {
                let ctx = format!("probe '{}'", probe.id);
                check_unit_range(&ctx, "position", probe.position)?;
            }
        }
        Mode::Probabilistic => {
            for pop in &req.populations {
                let ctx = format!("population '{}'", pop.id);
                if pop.quantity == 0 {
                    return Err(invalid(format!("{ctx}: quantity must be positive")));
                }
                check_morphology(&ctx, &pop.morphology)?;
            }
            for strat in &req.connection_strategies {
                let ctx = format!(
                    "connection rule '{}' -> '{}'",
                    strat.source_pop_id, strat.target_pop_id
                );
                check_unit_range(&ctx, "probability", strat.probability)?;
            }
            for stim in &req.stimulation_strategies {
                let ctx = format!("stimulation rule on '{}'", stim.target_pop_id);
                if !(0.0..=100.0).contains(&stim.percentage) {
                    return Err(invalid(format!(
                        "{ctx}: percentage must lie in [0, 100], got {}",
                        stim.percentage
                    )));
                }
                check_unit_range(&ctx, "position", stim.position)?;
            }
            for probe in &req.probabilistic_probes {
                let ctx = format!("probe rule '{}'", probe.id);
                check_unit_range(&ctx, "position", probe.position)?;
            }
        }
    }
    Ok(())
}

// =============================================================================
// MORPHOLOGY COMPILER
// =============================================================================

/// A compiled neuron: label-to-section mapping, immutable after construction
#[derive(Debug, Clone)]
pub struct Neuron {
    soma: SectionId,
    apical: Option<SectionId>,
    basal: Option<SectionId>,
}

impl Neuron {
    pub fn soma(&self) -> SectionId {
        self.soma
    }

    pub fn section(&self, kind: CompartmentKind) -> Option<SectionId> {
        match kind {
            CompartmentKind::Soma => Some(self.soma),
            CompartmentKind::Apical => self.apical,
            CompartmentKind::Basal => self.basal,
        }
    }

    /// Resolve a compartment reference, falling back to the soma when the
    /// named compartment does not exist. Returns the resolved label too,
    /// so callers can derive accurate trace names.
    pub fn section_or_soma(&self, kind: CompartmentKind) -> (SectionId, CompartmentKind) {
        match self.section(kind) {
            Some(id) => (id, kind),
            None => (self.soma, CompartmentKind::Soma),
        }
    }
}

/// Build one neuron from its morphology template. The soma is always
/// present; dendrites attach at fixed soma ends (apical distal, basal
/// proximal). Every section receives the identical mechanism set.
fn compile_morphology(
    engine: &mut Engine,
    instance: &str,
    morpho: &MorphologySpec,
    mechanisms: &[Mechanism],
) -> Result<Neuron> {
    let soma = engine.add_section(&format!("{instance}_soma"), morpho.soma_diam, morpho.soma_diam);

    let apical = if morpho.include_apical {
        let l = morpho
            .apical_l
            .ok_or_else(|| invalid(format!("'{instance}': apicalL missing")))?;
        let d = morpho
            .apical_diam
            .ok_or_else(|| invalid(format!("'{instance}': apicalDiam missing")))?;
        let sec = engine.add_section(&format!("{instance}_apical"), l, d);
        engine.attach(sec, soma, 1.0);
        Some(sec)
    } else {
        None
    };

    let basal = if morpho.include_basal {
        let l = morpho
            .basal_l
            .ok_or_else(|| invalid(format!("'{instance}': basalL missing")))?;
        let d = morpho
            .basal_diam
            .ok_or_else(|| invalid(format!("'{instance}': basalDiam missing")))?;
        let sec = engine.add_section(&format!("{instance}_basal"), l, d);
        engine.attach(sec, soma, 0.0);
        Some(sec)
    } else {
        None
    };

    let neuron = Neuron { soma, apical, basal };
    for kind in [CompartmentKind::Soma, CompartmentKind::Apical, CompartmentKind::Basal] {
        if let Some(sec) = neuron.section(kind) {
            for &mech in mechanisms {
                engine.insert(sec, mech);
            }
        }
    }
    Ok(neuron)
}

// =============================================================================
// SYNAPSE / STIMULUS FACTORY
// =============================================================================

/// Canonical kinetic presets per synapse kind
pub fn synapse_kinetics(kind: SynapseKind) -> SynapseKinetics {
    match kind {
        SynapseKind::Ampa => SynapseKinetics {
            tau_rise: 0.2,
            tau_decay: 2.0,
            reversal: 0.0,
        },
        SynapseKind::Gaba => SynapseKinetics {
            tau_rise: 0.5,
            tau_decay: 50.0,
            reversal: -80.0,
        },
    }
}

/// Unbounded stochastic-interval AMPA drive starting at time zero
fn attach_noisy_background(
    engine: &mut Engine,
    section: SectionId,
    position: f64,
    weight: f64,
) -> Result<()> {
    let gen = engine.add_generator(NOISY_INTERVAL, None, 0.0, true);
    let syn = engine.add_synapse(section, position, synapse_kinetics(SynapseKind::Ampa))?;
    engine.link_event(gen, syn, EVENT_LINK_DELAY, weight);
    Ok(())
}

/// Single synaptic event at the requested onset
fn attach_one_shot(
    engine: &mut Engine,
    section: SectionId,
    position: f64,
    kind: SynapseKind,
    delay: f64,
    weight: f64,
) -> Result<()> {
    let gen = engine.add_generator(1e9, Some(1), delay, false);
    let syn = engine.add_synapse(section, position, synapse_kinetics(kind))?;
    engine.link_event(gen, syn, EVENT_LINK_DELAY, weight);
    Ok(())
}

// =============================================================================
// TRACE HANDLES
// =============================================================================

/// Ties a request-level probe to its engine recorder
#[derive(Debug, Clone)]
pub struct TraceHandle {
    pub id: String,
    pub label: String,
    pub color: String,
    pub recorder: RecorderId,
}

// =============================================================================
// INDIVIDUAL-MODE ASSEMBLER
// =============================================================================

fn assemble_individual(
    engine: &mut Engine,
    req: &SimulationRequest,
    diag: &mut Diagnostics,
) -> Result<Vec<TraceHandle>> {
    let mut neurons: HashMap<&str, Neuron> = HashMap::new();
    for spec in &req.neurons {
        let cell = compile_morphology(engine, &spec.id, &spec.morphology, &[Mechanism::Hh])?;
        neurons.insert(spec.id.as_str(), cell);
    }

    for conn in &req.connections {
        let Some(source) = neurons.get(conn.source_id.as_str()) else {
            diag.unresolved("connection", &conn.source_id);
            continue;
        };
        let Some(target) = neurons.get(conn.target_id.as_str()) else {
            diag.unresolved("connection", &conn.target_id);
            continue;
        };
        let (section, _) = target.section_or_soma(conn.target_section);
        let syn = engine.add_synapse(section, conn.position, synapse_kinetics(conn.synapse_type))?;
        engine.link_spike(source.soma(), syn, conn.delay, conn.weight, conn.threshold);
    }

    for stim in &req.stimulators {
        let Some(target) = neurons.get(stim.target_id.as_str()) else {
            diag.unresolved("stimulator", &stim.target_id);
            continue;
        };
        let (section, _) = target.section_or_soma(stim.target_section);
        match stim.stim_type {
            StimKind::IClamp => {
                engine.add_clamp(section, stim.position, stim.delay, ICLAMP_DURATION, stim.weight);
            }
            StimKind::Ampa => {
                attach_one_shot(engine, section, stim.position, SynapseKind::Ampa, stim.delay, stim.weight)?;
            }
            StimKind::Gaba => {
                attach_one_shot(engine, section, stim.position, SynapseKind::Gaba, stim.delay, stim.weight)?;
            }
        }
    }

    let mut traces = Vec::new();
    for probe in &req.probes {
        let Some(target) = neurons.get(probe.target_id.as_str()) else {
            diag.unresolved("probe", &probe.target_id);
            continue;
        };
        // Probes do not fall back to the soma; a missing compartment skips
        // the probe entirely
        let Some(section) = target.section(probe.section) else {
            diag.missing_compartment("probe", &probe.id, probe.section);
            continue;
        };
        let recorder = engine.record(section, probe.position);
        let neuron_name = req
            .neurons
            .iter()
            .find(|n| n.id == probe.target_id)
            .map(|n| n.name.as_str())
            .unwrap_or("N/A");
        traces.push(TraceHandle {
            id: probe.id.clone(),
            label: format!("{} {} @ {:.2}", neuron_name, probe.section.base(), probe.position),
            color: probe.color.clone(),
            recorder,
        });
    }
    Ok(traces)
}

// =============================================================================
// PROBABILISTIC-MODE ASSEMBLER
// =============================================================================

/// POPULATE -> CONNECT -> STIMULATE -> PROBE
fn assemble_probabilistic(
    engine: &mut Engine,
    req: &SimulationRequest,
    rng: &mut StdRng,
    diag: &mut Diagnostics,
) -> Result<Vec<TraceHandle>> {
    // POPULATE: build members in declaration order, assigning dense global
    // identifiers and wiring a spike watcher per member
    let mut populations: HashMap<&str, Vec<Neuron>> = HashMap::new();
    let mut next_gid: Gid = 0;
    for pop in &req.populations {
        let mut mechanisms = vec![Mechanism::Hh];
        if THALAMIC_BURSTERS.contains(&pop.name.as_str()) {
            tracing::debug!(population = %pop.name, "inserting low-threshold calcium mechanism");
            mechanisms.push(Mechanism::CaT);
        }

        let mut members = Vec::with_capacity(pop.quantity);
        for i in 0..pop.quantity {
            let instance = format!("{}_n{}", pop.id, i);
            let cell = compile_morphology(engine, &instance, &pop.morphology, &mechanisms)?;
            engine.watch_spikes(cell.soma(), SPIKE_THRESHOLD, next_gid);
            next_gid += 1;
            members.push(cell);
        }
        populations.insert(pop.id.as_str(), members);
    }
    tracing::debug!(neurons = next_gid, "population instantiation complete");

    // CONNECT: independent Bernoulli trial per directed pair, no self-pairs
    for strat in &req.connection_strategies {
        let Some(source_pop) = populations.get(strat.source_pop_id.as_str()) else {
            diag.unresolved("connection rule", &strat.source_pop_id);
            continue;
        };
        let Some(target_pop) = populations.get(strat.target_pop_id.as_str()) else {
            diag.unresolved("connection rule", &strat.target_pop_id);
            continue;
        };
        let kinetics = synapse_kinetics(strat.synapse_type);
        for source in source_pop {
            for target in target_pop {
                if source.soma() == target.soma() {
                    continue;
                }
                if rng.gen::<f64>() < strat.probability {
                    let (section, _) = target.section_or_soma(strat.target_section);
                    let syn = engine.add_synapse(section, default_position(), kinetics)?;
                    engine.link_spike(source.soma(), syn, strat.delay, strat.weight, SPIKE_THRESHOLD);
                }
            }
        }
    }

    // STIMULATE: noisy rules cover every member; discrete rules sample
    // floor(n * pct / 100) members without replacement
    for stim in &req.stimulation_strategies {
        let Some(pop) = populations.get(stim.target_pop_id.as_str()) else {
            diag.unresolved("stimulation rule", &stim.target_pop_id);
            continue;
        };
        if stim.is_noisy {
            for cell in pop {
                attach_noisy_background(engine, cell.soma(), default_position(), stim.weight)?;
            }
        } else {
            let count = ((pop.len() as f64) * stim.percentage / 100.0).floor() as usize;
            let picks = rand::seq::index::sample(rng, pop.len(), count.min(pop.len()));
            for idx in picks.iter() {
                let cell = &pop[idx];
                let (section, _) = cell.section_or_soma(stim.target_section);
                match stim.stim_type {
                    StimKind::IClamp => {
                        engine.add_clamp(section, stim.position, stim.delay, ICLAMP_DURATION, stim.weight);
                    }
                    StimKind::Ampa => {
                        attach_one_shot(engine, section, stim.position, SynapseKind::Ampa, stim.delay, stim.weight)?;
                    }
                    StimKind::Gaba => {
                        attach_one_shot(engine, section, stim.position, SynapseKind::Gaba, stim.delay, stim.weight)?;
                    }
                }
            }
        }
    }

    // PROBE: sample min(count, n) members without replacement
    let mut traces = Vec::new();
    for probe in &req.probabilistic_probes {
        let Some(pop) = populations.get(probe.target_pop_id.as_str()) else {
            diag.unresolved("probe rule", &probe.target_pop_id);
            continue;
        };
        let pop_name = req
            .populations
            .iter()
            .find(|p| p.id == probe.target_pop_id)
            .map(|p| p.name.as_str())
            .unwrap_or("N/A");
        let count = probe.count.min(pop.len());
        let picks = rand::seq::index::sample(rng, pop.len(), count);
        for (i, idx) in picks.iter().enumerate() {
            let cell = &pop[idx];
            let (section, resolved) = cell.section_or_soma(probe.section);
            let recorder = engine.record(section, probe.position);
            traces.push(TraceHandle {
                id: format!("{}-{}", probe.id, i),
                label: format!("{} #{} ({})", pop_name, i + 1, resolved.base()),
                color: probe.color.clone(),
                recorder,
            });
        }
    }
    Ok(traces)
}

// =============================================================================
// RESULT COLLECTOR
// =============================================================================

/// Read recorded vectors back into the response, preserving probe insertion
/// order; in probabilistic mode also serialize the raster in recorded order
fn collect_results(engine: &Engine, handles: &[TraceHandle], probabilistic: bool) -> SimulationResponse {
    let traces = handles
        .iter()
        .map(|handle| {
            let series = engine.recorded(handle.recorder);
            TraceData {
                label: handle.label.clone(),
                color: handle.color.clone(),
                time: series.time.clone(),
                voltage: series.values.clone(),
            }
        })
        .collect();

    let spike_data = probabilistic.then(|| {
        engine
            .raster()
            .iter()
            .map(|(t, gid)| SpikePoint { x: t, y: gid })
            .collect()
    });

    SimulationResponse { traces, spike_data }
}

// =============================================================================
// ORCHESTRATION
// =============================================================================

/// Response plus the structured skip diagnostics accumulated during assembly
#[derive(Debug)]
pub struct SimulationReport {
    pub response: SimulationResponse,
    pub diagnostics: Diagnostics,
}

/// Build the network described by `req`, run it to `tstop`, and collect
/// traces and (in probabilistic mode) the spike raster.
pub fn run_simulation(req: &SimulationRequest, config: &SimulatorConfig) -> Result<SimulationReport> {
    validate(req)?;

    let mut engine = match config.seed {
        Some(seed) => Engine::with_seed(config.dt, seed),
        None => Engine::new(config.dt),
    };
    // Separate stream from the engine's event-train generator
    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed ^ 0x9e37_79b9_7f4a_7c15),
        None => StdRng::from_entropy(),
    };
    let mut diagnostics = Diagnostics::default();

    let handles = match req.mode {
        Mode::Individual => assemble_individual(&mut engine, req, &mut diagnostics)?,
        Mode::Probabilistic => assemble_probabilistic(&mut engine, req, &mut rng, &mut diagnostics)?,
    };

    engine.initialize(config.v_init);
    engine.run_to(req.tstop)?;

    let response = collect_results(&engine, &handles, req.mode == Mode::Probabilistic);
    Ok(SimulationReport {
        response,
        diagnostics,
    })
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn soma_only(diam: f64) -> MorphologySpec {
        MorphologySpec {
            soma_diam: diam,
            include_apical: false,
            include_basal: false,
            apical_l: None,
            apical_diam: None,
            basal_l: None,
            basal_diam: None,
        }
    }

    fn population(id: &str, name: &str, quantity: usize) -> PopulationSpec {
        PopulationSpec {
            id: id.to_string(),
            name: name.to_string(),
            quantity,
            morphology: soma_only(20.0),
        }
    }

    fn empty_request(mode: Mode) -> SimulationRequest {
        SimulationRequest {
            mode,
            tstop: 50.0,
            neurons: vec![],
            connections: vec![],
            stimulators: vec![],
            probes: vec![],
            populations: vec![],
            connection_strategies: vec![],
            stimulation_strategies: vec![],
            probabilistic_probes: vec![],
        }
    }

    fn strategy(src: &str, tgt: &str, p: f64) -> ConnectionStrategy {
        ConnectionStrategy {
            source_pop_id: src.to_string(),
            target_pop_id: tgt.to_string(),
            target_section: CompartmentKind::Soma,
            synapse_type: SynapseKind::Ampa,
            probability: p,
            delay: 1.0,
            weight: 0.01,
        }
    }

    fn assemble(req: &SimulationRequest) -> (Engine, Vec<TraceHandle>, Diagnostics) {
        let mut engine = Engine::with_seed(DEFAULT_DT, 7);
        let mut rng = StdRng::seed_from_u64(7);
        let mut diag = Diagnostics::default();
        let handles = match req.mode {
            Mode::Individual => assemble_individual(&mut engine, req, &mut diag).unwrap(),
            Mode::Probabilistic => {
                assemble_probabilistic(&mut engine, req, &mut rng, &mut diag).unwrap()
            }
        };
        (engine, handles, diag)
    }

    #[test]
    fn test_population_gids_dense_and_unique() {
        let mut req = empty_request(Mode::Probabilistic);
        req.populations = vec![population("a", "Cortex", 3), population("b", "Thalamus", 2)];

        let (engine, _, diag) = assemble(&req);
        assert_eq!(engine.section_count(), 5);
        assert_eq!(engine.watched_gids(), vec![0, 1, 2, 3, 4]);
        assert!(diag.is_clean());
    }

    #[test]
    fn test_thalamic_populations_get_calcium_channels() {
        let mut req = empty_request(Mode::Probabilistic);
        req.populations = vec![population("a", "TC", 1), population("b", "Cortex", 1)];

        let (engine, _, _) = assemble(&req);
        assert_eq!(
            engine.section_mechanisms(SectionId(0)),
            &[Mechanism::Hh, Mechanism::CaT]
        );
        assert_eq!(engine.section_mechanisms(SectionId(1)), &[Mechanism::Hh]);
    }

    #[test]
    fn test_connection_probability_extremes() {
        let mut req = empty_request(Mode::Probabilistic);
        req.populations = vec![population("a", "A", 3), population("b", "B", 3)];
        req.connection_strategies = vec![strategy("a", "b", 0.0)];

        let (engine, _, _) = assemble(&req);
        assert_eq!(engine.spike_link_count(), 0);
        assert_eq!(engine.synapse_count(), 0);

        req.connection_strategies = vec![strategy("a", "b", 1.0)];
        let (engine, _, _) = assemble(&req);
        // 3 x 3 cross-population pairs, no self-pairs possible
        assert_eq!(engine.spike_link_count(), 9);
        assert_eq!(engine.synapse_count(), 9);
    }

    #[test]
    fn test_self_pairs_excluded_within_population() {
        let mut req = empty_request(Mode::Probabilistic);
        req.populations = vec![population("a", "A", 4)];
        req.connection_strategies = vec![strategy("a", "a", 1.0)];

        let (engine, _, _) = assemble(&req);
        assert_eq!(engine.spike_link_count(), 4 * 4 - 4);
    }

    #[test]
    fn test_noisy_stimulation_covers_every_member() {
        let mut req = empty_request(Mode::Probabilistic);
        req.populations = vec![population("a", "A", 5)];
        req.stimulation_strategies = vec![StimulationStrategy {
            target_pop_id: "a".to_string(),
            stim_type: StimKind::Ampa,
            is_noisy: true,
            percentage: 100.0,
            target_section: CompartmentKind::Soma,
            position: 0.5,
            delay: 0.0,
            weight: 0.01,
        }];

        let (engine, _, _) = assemble(&req);
        assert_eq!(engine.generator_count(), 5);
        assert_eq!(engine.event_link_count(), 5);
        assert_eq!(engine.synapse_count(), 5);
        assert_eq!(engine.clamp_count(), 0);
    }

    #[test]
    fn test_percentage_sampling_floors_count() {
        let mut req = empty_request(Mode::Probabilistic);
        req.populations = vec![population("a", "A", 10)];
        req.stimulation_strategies = vec![StimulationStrategy {
            target_pop_id: "a".to_string(),
            stim_type: StimKind::IClamp,
            is_noisy: false,
            percentage: 25.0,
            target_section: CompartmentKind::Soma,
            position: 0.5,
            delay: 5.0,
            weight: 0.5,
        }];

        let (engine, _, _) = assemble(&req);
        // floor(10 * 25 / 100) = 2, sampled without replacement
        assert_eq!(engine.clamp_count(), 2);

        req.stimulation_strategies[0].percentage = 100.0;
        let (engine, _, _) = assemble(&req);
        assert_eq!(engine.clamp_count(), 10);
    }

    #[test]
    fn test_probe_count_clamped_to_population_size() {
        let mut req = empty_request(Mode::Probabilistic);
        req.populations = vec![population("a", "A", 10)];
        req.probabilistic_probes = vec![ProbabilisticProbe {
            id: "p1".to_string(),
            target_pop_id: "a".to_string(),
            section: CompartmentKind::Soma,
            position: 0.5,
            count: 15,
            color: "#ff0000".to_string(),
        }];

        let (engine, handles, _) = assemble(&req);
        assert_eq!(engine.recorder_count(), 10);
        assert_eq!(handles.len(), 10);
        assert_eq!(handles[0].label, "A #1 (Soma)");
        assert_eq!(handles[0].id, "p1-0");
    }

    #[test]
    fn test_unknown_population_rule_skipped() {
        let mut req = empty_request(Mode::Probabilistic);
        req.populations = vec![population("a", "A", 2)];
        req.connection_strategies = vec![strategy("a", "ghost", 1.0)];
        req.stimulation_strategies = vec![StimulationStrategy {
            target_pop_id: "ghost".to_string(),
            stim_type: StimKind::IClamp,
            is_noisy: false,
            percentage: 100.0,
            target_section: CompartmentKind::Soma,
            position: 0.5,
            delay: 0.0,
            weight: 0.5,
        }];

        let (engine, _, diag) = assemble(&req);
        assert_eq!(engine.spike_link_count(), 0);
        assert_eq!(engine.clamp_count(), 0);
        assert_eq!(diag.warnings.len(), 2);
    }

    #[test]
    fn test_individual_unresolved_connection_skipped() {
        let mut req = empty_request(Mode::Individual);
        req.neurons = vec![
            NeuronSpec {
                id: "n1".to_string(),
                name: "Pyramidal".to_string(),
                morphology: soma_only(20.0),
            },
            NeuronSpec {
                id: "n2".to_string(),
                name: "Interneuron".to_string(),
                morphology: soma_only(15.0),
            },
        ];
        req.connections = vec![
            ConnectionSpec {
                source_id: "n1".to_string(),
                target_id: "ghost".to_string(),
                target_section: CompartmentKind::Soma,
                position: 0.5,
                synapse_type: SynapseKind::Ampa,
                delay: 1.0,
                weight: 0.01,
                threshold: SPIKE_THRESHOLD,
            },
            ConnectionSpec {
                source_id: "n1".to_string(),
                target_id: "n2".to_string(),
                target_section: CompartmentKind::Soma,
                position: 0.5,
                synapse_type: SynapseKind::Gaba,
                delay: 1.0,
                weight: 0.01,
                threshold: SPIKE_THRESHOLD,
            },
        ];

        let (engine, _, diag) = assemble(&req);
        // The dangling connection is skipped; the valid one survives
        assert_eq!(engine.spike_link_count(), 1);
        assert_eq!(diag.warnings.len(), 1);
    }

    #[test]
    fn test_individual_probe_missing_compartment_is_skipped() {
        let mut req = empty_request(Mode::Individual);
        req.neurons = vec![NeuronSpec {
            id: "n1".to_string(),
            name: "Cell".to_string(),
            morphology: soma_only(20.0),
        }];
        req.probes = vec![ProbeSpec {
            id: "pr1".to_string(),
            target_id: "n1".to_string(),
            section: CompartmentKind::Apical,
            position: 0.5,
            color: "#00ff00".to_string(),
        }];

        let (engine, handles, diag) = assemble(&req);
        // No soma fallback for probes
        assert_eq!(engine.recorder_count(), 0);
        assert!(handles.is_empty());
        assert_eq!(diag.warnings.len(), 1);
    }

    #[test]
    fn test_connection_falls_back_to_soma() {
        let mut req = empty_request(Mode::Individual);
        req.neurons = vec![
            NeuronSpec {
                id: "n1".to_string(),
                name: "A".to_string(),
                morphology: soma_only(20.0),
            },
            NeuronSpec {
                id: "n2".to_string(),
                name: "B".to_string(),
                morphology: soma_only(20.0),
            },
        ];
        req.connections = vec![ConnectionSpec {
            source_id: "n1".to_string(),
            target_id: "n2".to_string(),
            target_section: CompartmentKind::Apical,
            position: 0.5,
            synapse_type: SynapseKind::Ampa,
            delay: 1.0,
            weight: 0.01,
            threshold: SPIKE_THRESHOLD,
        }];

        let (engine, _, diag) = assemble(&req);
        assert_eq!(engine.synapse_count(), 1);
        assert_eq!(engine.spike_link_count(), 1);
        assert!(diag.is_clean());
    }

    #[test]
    fn test_morphology_with_dendrites() {
        let mut req = empty_request(Mode::Individual);
        req.neurons = vec![NeuronSpec {
            id: "n1".to_string(),
            name: "Pyramidal".to_string(),
            morphology: MorphologySpec {
                soma_diam: 20.0,
                include_apical: true,
                include_basal: true,
                apical_l: Some(400.0),
                apical_diam: Some(2.0),
                basal_l: Some(200.0),
                basal_diam: Some(3.0),
            },
        }];
        req.probes = vec![ProbeSpec {
            id: "pr1".to_string(),
            target_id: "n1".to_string(),
            section: CompartmentKind::Apical,
            position: 0.25,
            color: "#0000ff".to_string(),
        }];

        let (engine, handles, diag) = assemble(&req);
        assert_eq!(engine.section_count(), 3);
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].label, "Pyramidal Apical @ 0.25");
        assert!(diag.is_clean());
        // Identical mechanism set on every compartment
        for i in 0..3 {
            assert_eq!(engine.section_mechanisms(SectionId(i)), &[Mechanism::Hh]);
        }
    }

    #[test]
    fn test_validation_rejects_bad_geometry() {
        let mut req = empty_request(Mode::Individual);
        req.neurons = vec![NeuronSpec {
            id: "n1".to_string(),
            name: "Bad".to_string(),
            morphology: soma_only(0.0),
        }];

        let err = run_simulation(&req, &SimulatorConfig::default()).unwrap_err();
        assert!(matches!(err, CircuitError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_validation_requires_dendrite_geometry() {
        let mut req = empty_request(Mode::Probabilistic);
        let mut morpho = soma_only(20.0);
        morpho.include_apical = true; // no apicalL / apicalDiam
        req.populations = vec![PopulationSpec {
            id: "a".to_string(),
            name: "A".to_string(),
            quantity: 1,
            morphology: morpho,
        }];

        let err = run_simulation(&req, &SimulatorConfig::default()).unwrap_err();
        assert!(matches!(err, CircuitError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_validation_rejects_out_of_range_probability() {
        let mut req = empty_request(Mode::Probabilistic);
        req.populations = vec![population("a", "A", 2)];
        req.connection_strategies = vec![strategy("a", "a", 1.5)];

        let err = run_simulation(&req, &SimulatorConfig::default()).unwrap_err();
        assert!(matches!(err, CircuitError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_full_probabilistic_run_trace_length() {
        let mut req = empty_request(Mode::Probabilistic);
        req.tstop = 50.0;
        req.populations = vec![population("tc", "TC", 1)];
        req.probabilistic_probes = vec![ProbabilisticProbe {
            id: "p1".to_string(),
            target_pop_id: "tc".to_string(),
            section: CompartmentKind::Soma,
            position: 0.5,
            count: 1,
            color: "#ff0000".to_string(),
        }];

        let config = SimulatorConfig {
            seed: Some(7),
            ..Default::default()
        };
        let report = run_simulation(&req, &config).unwrap();
        assert_eq!(report.response.traces.len(), 1);
        // tstop / dt + 1 samples
        assert_eq!(report.response.traces[0].time.len(), 2001);
        assert_eq!(report.response.traces[0].voltage.len(), 2001);
        assert!(report.response.spike_data.is_some());
        assert!(report.diagnostics.is_clean());
    }

    #[test]
    fn test_individual_mode_has_no_spike_data() {
        let mut req = empty_request(Mode::Individual);
        req.tstop = 10.0;
        req.neurons = vec![NeuronSpec {
            id: "n1".to_string(),
            name: "Cell".to_string(),
            morphology: soma_only(20.0),
        }];
        req.probes = vec![ProbeSpec {
            id: "pr1".to_string(),
            target_id: "n1".to_string(),
            section: CompartmentKind::Soma,
            position: 0.5,
            color: "#123456".to_string(),
        }];

        let report = run_simulation(&req, &SimulatorConfig::default()).unwrap();
        assert_eq!(report.response.traces.len(), 1);
        assert!(report.response.spike_data.is_none());
    }

    #[test]
    fn test_diverging_run_is_fatal_with_no_results() {
        let mut req = empty_request(Mode::Individual);
        req.tstop = 10.0;
        req.neurons = vec![NeuronSpec {
            id: "n1".to_string(),
            name: "Cell".to_string(),
            morphology: soma_only(20.0),
        }];
        req.stimulators = vec![StimulatorSpec {
            target_id: "n1".to_string(),
            stim_type: StimKind::IClamp,
            target_section: CompartmentKind::Soma,
            position: 0.5,
            delay: 0.0,
            weight: f64::INFINITY,
        }];
        req.probes = vec![ProbeSpec {
            id: "pr1".to_string(),
            target_id: "n1".to_string(),
            section: CompartmentKind::Soma,
            position: 0.5,
            color: "#ff0000".to_string(),
        }];

        let err = run_simulation(&req, &SimulatorConfig::default()).unwrap_err();
        assert!(matches!(err, CircuitError::NumericalError(_)));
    }

    #[test]
    fn test_response_round_trip_preserves_sequences() {
        let response = SimulationResponse {
            traces: vec![TraceData {
                label: "A #1 (Soma)".to_string(),
                color: "#ff0000".to_string(),
                time: vec![0.0, 0.025, 0.05],
                voltage: vec![-65.0, -64.98, -64.95],
            }],
            spike_data: Some(vec![SpikePoint { x: 12.5, y: 3 }, SpikePoint { x: 12.5, y: 1 }]),
        };

        let json = serde_json::to_string(&response).unwrap();
        let back: SimulationResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back, response);
    }

    #[test]
    fn test_request_wire_format() {
        let json = r##"{
            "mode": "probabilistic",
            "tstop": 200.0,
            "populations": [
                {"id": "tc", "name": "TC", "quantity": 3,
                 "morphology": {"somaDiam": 20.0, "includeApical": false, "includeBasal": false}}
            ],
            "connectionStrategies": [
                {"sourcePopId": "tc", "targetPopId": "tc", "targetSection": "Soma",
                 "synapseType": "GABA", "probability": 0.2, "delay": 1.0, "weight": 0.005}
            ],
            "stimulationStrategies": [
                {"targetPopId": "tc", "stimType": "IClamp", "isNoisy": false,
                 "percentage": 50.0, "delay": 10.0, "weight": 0.3}
            ],
            "probabilisticProbes": [
                {"id": "p1", "targetPopId": "tc", "section": "Apical Dendrite",
                 "count": 2, "color": "#00ffaa"}
            ]
        }"##;

        let req: SimulationRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.mode, Mode::Probabilistic);
        assert_eq!(req.populations[0].quantity, 3);
        assert_eq!(req.connection_strategies[0].synapse_type, SynapseKind::Gaba);
        assert_eq!(req.stimulation_strategies[0].percentage, 50.0);
        assert_eq!(req.probabilistic_probes[0].section, CompartmentKind::Apical);
        assert_eq!(req.probabilistic_probes[0].position, 0.5); // default

        validate(&req).unwrap();
    }

    #[test]
    fn test_seeded_runs_are_reproducible() {
        let mut req = empty_request(Mode::Probabilistic);
        req.tstop = 20.0;
        req.populations = vec![population("a", "A", 5)];
        req.connection_strategies = vec![strategy("a", "a", 0.5)];
        req.probabilistic_probes = vec![ProbabilisticProbe {
            id: "p1".to_string(),
            target_pop_id: "a".to_string(),
            section: CompartmentKind::Soma,
            position: 0.5,
            count: 2,
            color: "#ffffff".to_string(),
        }];

        let config = SimulatorConfig {
            seed: Some(42),
            ..Default::default()
        };
        let first = run_simulation(&req, &config).unwrap();
        let second = run_simulation(&req, &config).unwrap();
        assert_eq!(first.response, second.response);
    }
}
