//! Text checkpoint format: whitespace-delimited tokens, one entity per line.
//!
//! Layout:
//!   header   `neurogrow-checkpoint <version> <neurons> <max_per_neuron> <model> <tick>`
//!   neurons  one line per neuron (`NeuronArrays` entity order)
//!   synapses one line per slot, free slots included (`SynapseStore` entity order)
//!   radii    one line, `neurons` floats
//!   rates    one line, `neurons` floats
//!
//! Floats are written with the shortest representation that parses back to
//! the same value. Delivery rings are not part of an entity: reading a slot
//! clears its ring.

use std::fmt::Display;
use std::io::{self, BufRead, Write};
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::neuron::{NeuronArrays, NeuronKind};
use crate::queue::RING_LENGTH;
use crate::synapse::{PlasticityLayer, SynapseModel, SynapseStore, SynapseType};

const MAGIC: &str = "neurogrow-checkpoint";
const VERSION: u32 = 1;

// ---- Write primitives ----

/// Writes tokens separated by single spaces, entities separated by newlines.
pub struct TokenWriter<W: Write> {
    inner: W,
    at_line_start: bool,
}

impl<W: Write> TokenWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, at_line_start: true }
    }

    pub fn field(&mut self, value: impl Display) -> io::Result<()> {
        if !self.at_line_start {
            self.inner.write_all(b" ")?;
        }
        write!(self.inner, "{value}")?;
        self.at_line_start = false;
        Ok(())
    }

    /// Terminate the current entity.
    pub fn end_entity(&mut self) -> io::Result<()> {
        self.inner.write_all(b"\n")?;
        self.at_line_start = true;
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

// ---- Read primitives ----

/// Consumes tokens in the order they were written. Line breaks are
/// treated like any other whitespace.
pub struct TokenReader<R: BufRead> {
    inner: R,
    line: String,
    pos: usize,
}

impl<R: BufRead> TokenReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, line: String::new(), pos: 0 }
    }

    /// Next raw token. `field` names what is being read, for error reports.
    pub fn token(&mut self, field: &'static str) -> Result<&str> {
        let (start, end) = loop {
            let rest = &self.line[self.pos..];
            let skipped = rest.len() - rest.trim_start().len();
            let start = self.pos + skipped;
            if start < self.line.len() {
                let end = self.line[start..]
                    .find(char::is_whitespace)
                    .map_or(self.line.len(), |e| start + e);
                break (start, end);
            }
            self.line.clear();
            self.pos = 0;
            if self.inner.read_line(&mut self.line)? == 0 {
                return Err(Error::UnexpectedEof { field });
            }
        };
        self.pos = end;
        Ok(&self.line[start..end])
    }

    /// Next token parsed as `T`.
    pub fn parse<T: FromStr>(&mut self, field: &'static str) -> Result<T> {
        let token = self.token(field)?;
        token.parse::<T>().map_err(|_| Error::Malformed { field, token: token.to_string() })
    }

    /// `0`/`1` flag.
    pub fn flag(&mut self, field: &'static str) -> Result<bool> {
        match self.token(field)? {
            "0" => Ok(false),
            "1" => Ok(true),
            other => Err(Error::Malformed { field, token: other.to_string() }),
        }
    }

    /// `n` floats.
    pub fn f32_row(&mut self, n: usize, field: &'static str) -> Result<Vec<f32>> {
        (0..n).map(|_| self.parse::<f32>(field)).collect()
    }
}

// ---- Entity contract ----

/// Per-entity serialization of a store.
///
/// `write_entity(i)` emits exactly the tokens `read_entity(i)` consumes, in
/// the same order, followed by an entity terminator.
pub trait EntityStream {
    /// Number of entities (neurons, or synapse slots).
    fn entity_count(&self) -> usize;

    fn write_entity<W: Write>(&self, out: &mut TokenWriter<W>, index: usize) -> io::Result<()>;

    fn read_entity<R: BufRead>(&mut self, input: &mut TokenReader<R>, index: usize) -> Result<()>;

    fn write_all_entities<W: Write>(&self, out: &mut TokenWriter<W>) -> io::Result<()> {
        for i in 0..self.entity_count() {
            self.write_entity(out, i)?;
        }
        Ok(())
    }

    fn read_all_entities<R: BufRead>(&mut self, input: &mut TokenReader<R>) -> Result<()> {
        for i in 0..self.entity_count() {
            self.read_entity(input, i)?;
        }
        Ok(())
    }
}

impl EntityStream for NeuronArrays {
    fn entity_count(&self) -> usize {
        self.len()
    }

    fn write_entity<W: Write>(&self, out: &mut TokenWriter<W>, i: usize) -> io::Result<()> {
        out.field(self.kind[i])?;
        out.field(u8::from(self.starter[i]))?;
        out.field(self.vm[i])?;
        out.field(self.v_thresh[i])?;
        out.field(self.v_rest[i])?;
        out.field(self.v_reset[i])?;
        out.field(self.v_init[i])?;
        out.field(self.i_inject[i])?;
        out.field(self.i_noise[i])?;
        out.field(self.tau[i])?;
        out.field(self.cm[i])?;
        out.field(self.t_refract[i])?;
        out.field(self.refract_remaining[i])?;
        out.end_entity()
    }

    fn read_entity<R: BufRead>(&mut self, input: &mut TokenReader<R>, i: usize) -> Result<()> {
        self.kind[i] = input.parse::<NeuronKind>("kind")?;
        self.starter[i] = input.flag("starter")?;
        self.vm[i] = input.parse("vm")?;
        self.v_thresh[i] = input.parse("v_thresh")?;
        self.v_rest[i] = input.parse("v_rest")?;
        self.v_reset[i] = input.parse("v_reset")?;
        self.v_init[i] = input.parse("v_init")?;
        self.i_inject[i] = input.parse("i_inject")?;
        self.i_noise[i] = input.parse("i_noise")?;
        self.tau[i] = input.parse("tau")?;
        self.cm[i] = input.parse("cm")?;
        self.t_refract[i] = input.parse("t_refract")?;
        self.refract_remaining[i] = input.parse("refract_remaining")?;

        if !(self.tau[i] > 0.0 && self.cm[i] > 0.0) {
            return Err(Error::InvalidSlot {
                slot: i,
                reason: format!("neuron tau {} and cm {} must be positive", self.tau[i], self.cm[i]),
            });
        }
        self.init_constants(i);
        self.summation[i] = 0.0;
        self.spike_out[i] = false;
        Ok(())
    }
}

/// Fields of one slot as read from a stream, before validation.
struct SlotRecord {
    source: u32,
    dest: u32,
    weight: f32,
    psr: f32,
    decay: f32,
    tau: f32,
    total_delay: u32,
    ty: SynapseType,
    stp: Option<[f32; 5]>,
    last_spike: u64,
}

impl SlotRecord {
    fn companions_zero(&self) -> bool {
        let stp_zero = self.stp.map_or(true, |v| v.iter().all(|&x| x == 0.0)) && self.last_spike == 0;
        self.source == 0
            && self.dest == 0
            && self.psr == 0.0
            && self.decay == 0.0
            && self.tau == 0.0
            && self.total_delay == 0
            && self.ty == SynapseType::None
            && stp_zero
    }
}

fn in_open_range(v: f32, lo: f32, hi: f32) -> bool {
    v > lo && v < hi
}

impl SynapseStore {
    fn validate_record(&self, slot: usize, rec: &SlotRecord) -> Result<()> {
        let invalid = |reason: String| Error::InvalidSlot { slot, reason };
        if rec.weight == 0.0 {
            if !rec.companions_zero() {
                return Err(invalid("free slot carries nonzero fields".into()));
            }
            return Ok(());
        }
        if !(rec.weight.is_finite() && rec.psr.is_finite()) {
            return Err(invalid(format!("weight {} and psr {} must be finite", rec.weight, rec.psr)));
        }
        if !(rec.decay > 0.0 && rec.decay <= 1.0) {
            return Err(invalid(format!("decay {} outside (0, 1]", rec.decay)));
        }
        if !(rec.tau > 0.0 && rec.tau.is_finite()) {
            return Err(invalid(format!("tau {} must be positive", rec.tau)));
        }
        let owner = slot / self.max_per_neuron();
        if rec.dest as usize != owner {
            return Err(invalid(format!("dest {} does not own this slot (expected {owner})", rec.dest)));
        }
        if rec.source as usize >= self.neuron_count() {
            return Err(invalid(format!("source {} out of range", rec.source)));
        }
        if rec.ty == SynapseType::None {
            return Err(invalid("occupied slot has no synapse type".into()));
        }
        if rec.total_delay >= RING_LENGTH {
            return Err(invalid(format!("total_delay {} exceeds the delivery ring", rec.total_delay)));
        }
        if let Some([r, u_now, d, u, f]) = rec.stp {
            if !(r.is_finite() && u_now.is_finite()) {
                return Err(invalid(format!("r {r} and u {u_now} must be finite")));
            }
            if !in_open_range(d, 0.0, 10.0) {
                return Err(invalid(format!("D {d} outside (0, 10)")));
            }
            if !in_open_range(f, 0.0, 10.0) {
                return Err(invalid(format!("F {f} outside (0, 10)")));
            }
            if !in_open_range(u, 1.0e-5, 1.0) {
                return Err(invalid(format!("U {u} outside (1e-5, 1)")));
            }
        }
        Ok(())
    }
}

impl EntityStream for SynapseStore {
    fn entity_count(&self) -> usize {
        self.capacity()
    }

    fn write_entity<W: Write>(&self, out: &mut TokenWriter<W>, i: usize) -> io::Result<()> {
        let b = &self.base;
        out.field(b.source[i])?;
        out.field(b.dest[i])?;
        out.field(b.weight[i])?;
        out.field(b.psr[i])?;
        out.field(b.decay[i])?;
        out.field(b.tau[i])?;
        out.field(b.total_delay[i])?;
        out.field(b.ty[i].code())?;
        if let PlasticityLayer::Dynamic(d) = &self.layer {
            out.field(d.last_spike[i])?;
            out.field(d.r[i])?;
            out.field(d.u[i])?;
            out.field(d.depression_tau[i])?;
            out.field(d.utilization[i])?;
            out.field(d.facilitation_tau[i])?;
        }
        out.end_entity()
    }

    fn read_entity<R: BufRead>(&mut self, input: &mut TokenReader<R>, i: usize) -> Result<()> {
        let source = input.parse("source")?;
        let dest = input.parse("dest")?;
        let weight = input.parse("weight")?;
        let psr = input.parse("psr")?;
        let decay = input.parse("decay")?;
        let tau = input.parse("tau")?;
        let total_delay = input.parse("total_delay")?;
        let code: u8 = input.parse("type")?;
        let ty = SynapseType::from_code(code)
            .ok_or_else(|| Error::Malformed { field: "type", token: code.to_string() })?;

        let (stp, last_spike) = match self.layer {
            PlasticityLayer::None => (None, 0),
            PlasticityLayer::Dynamic(_) => {
                let last_spike = input.parse::<u64>("last_spike")?;
                let fields = [
                    input.parse("r")?,
                    input.parse("u")?,
                    input.parse("D")?,
                    input.parse("U")?,
                    input.parse("F")?,
                ];
                (Some(fields), last_spike)
            }
        };
        let rec = SlotRecord { source, dest, weight, psr, decay, tau, total_delay, ty, stp, last_spike };
        self.validate_record(i, &rec)?;

        let owner = i / self.max_per_neuron();
        let was_occupied = !self.is_free(i);
        let now_occupied = rec.weight != 0.0;

        let b = &mut self.base;
        b.source[i] = rec.source;
        b.dest[i] = rec.dest;
        b.weight[i] = rec.weight;
        b.psr[i] = rec.psr;
        b.decay[i] = rec.decay;
        b.tau[i] = rec.tau;
        b.total_delay[i] = rec.total_delay;
        b.ty[i] = rec.ty;
        if let (PlasticityLayer::Dynamic(d), Some([r, u, big_d, big_u, big_f])) = (&mut self.layer, rec.stp) {
            d.last_spike[i] = rec.last_spike;
            d.r[i] = r;
            d.u[i] = u;
            d.depression_tau[i] = big_d;
            d.utilization[i] = big_u;
            d.facilitation_tau[i] = big_f;
        }
        self.queue.clear(i);

        match (was_occupied, now_occupied) {
            (false, true) => self.synapse_counts[owner] += 1,
            (true, false) => self.synapse_counts[owner] = self.synapse_counts[owner].saturating_sub(1),
            _ => {}
        }
        Ok(())
    }
}

// ---- Checkpoint framing ----

/// First line of a checkpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CheckpointHeader {
    pub neurons: usize,
    pub max_per_neuron: usize,
    pub model: SynapseModel,
    pub tick: u64,
}

impl CheckpointHeader {
    pub fn write<W: Write>(&self, out: &mut TokenWriter<W>) -> io::Result<()> {
        out.field(MAGIC)?;
        out.field(VERSION)?;
        out.field(self.neurons)?;
        out.field(self.max_per_neuron)?;
        out.field(self.model)?;
        out.field(self.tick)?;
        out.end_entity()
    }

    pub fn read<R: BufRead>(input: &mut TokenReader<R>) -> Result<Self> {
        let magic = input.token("magic")?;
        if magic != MAGIC {
            return Err(Error::Malformed { field: "magic", token: magic.to_string() });
        }
        let version: u32 = input.parse("version")?;
        if version != VERSION {
            return Err(Error::Malformed { field: "version", token: version.to_string() });
        }
        let neurons = input.parse("neurons")?;
        let max_per_neuron = input.parse("max_per_neuron")?;
        let model = input.parse::<SynapseModel>("model")?;
        let tick = input.parse("tick")?;
        Ok(Self { neurons, max_per_neuron, model, tick })
    }
}

/// One line of floats.
pub fn write_f32_row<W: Write>(out: &mut TokenWriter<W>, values: &[f32]) -> io::Result<()> {
    for &v in values {
        out.field(v)?;
    }
    out.end_entity()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NeuronParams;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    const DT: f32 = 1.0e-4;

    fn reader(text: &str) -> TokenReader<&[u8]> {
        TokenReader::new(text.as_bytes())
    }

    fn encode<E: EntityStream>(store: &E) -> String {
        let mut out = TokenWriter::new(Vec::new());
        store.write_all_entities(&mut out).unwrap();
        String::from_utf8(out.into_inner()).unwrap()
    }

    fn dynamic_store() -> SynapseStore {
        let mut s = SynapseStore::new(SynapseModel::Dynamic);
        s.setup(2, 2);
        s.create_synapse(1, 0, 3.5e-9, SynapseType::EE, DT);
        s.create_synapse(0, 1, -1.25e-9, SynapseType::IE, DT);
        s
    }

    #[test]
    fn tokens_span_lines_and_report_eof() {
        let mut r = reader("  1 2.5\n\n  x");
        assert_eq!(r.parse::<u32>("a").unwrap(), 1);
        assert_eq!(r.parse::<f32>("b").unwrap(), 2.5);
        assert!(matches!(r.parse::<u32>("c"), Err(Error::Malformed { field: "c", .. })));
        assert!(matches!(r.token("d"), Err(Error::UnexpectedEof { field: "d" })));
    }

    #[test]
    fn one_slot_per_line() {
        let text = encode(&dynamic_store());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[1], "0 0 0 0 0 0 0 0 0 0 0 0 0 0");
        assert!(lines[0].starts_with("1 0 0.0000000035 "));
        assert!(lines[0].contains(" 18446744073709551615 "), "never-spiked marker survives");
    }

    #[test]
    fn synapse_entities_round_trip_and_clear_rings() {
        let store = dynamic_store();
        let text = encode(&store);

        let mut back = SynapseStore::new(SynapseModel::Dynamic);
        back.setup(2, 2);
        back.queue.schedule_delivery(0, 0, 3);
        back.read_all_entities(&mut reader(&text)).unwrap();

        assert_eq!(back.base, store.base);
        assert_eq!(back.layer, store.layer);
        assert_eq!(back.synapse_counts, store.synapse_counts);
        assert_eq!(back.queue.pending(0), 0);
    }

    #[test]
    fn out_of_range_dynamics_are_rejected() {
        let store = dynamic_store();
        let text = encode(&store).replacen(" 1.1 ", " 12 ", 1);
        let mut back = SynapseStore::new(SynapseModel::Dynamic);
        back.setup(2, 2);
        let err = back.read_all_entities(&mut reader(&text)).unwrap_err();
        assert!(matches!(err, Error::InvalidSlot { slot: 0, .. }), "{err}");
    }

    #[test]
    fn wrong_destination_is_rejected() {
        let mut s = SynapseStore::new(SynapseModel::Spiking);
        s.setup(2, 2);
        let err = s.read_entity(&mut reader("0 1 1.5 0 0.9 0.003 16 4"), 0).unwrap_err();
        assert!(matches!(err, Error::InvalidSlot { slot: 0, .. }));
    }

    #[test]
    fn degenerate_decay_and_non_finite_values_are_rejected() {
        let mut s = SynapseStore::new(SynapseModel::Spiking);
        s.setup(1, 1);
        for line in [
            "0 0 1.0 0 0 0.003 5 4",
            "0 0 1.0 0 1.5 0.003 5 4",
            "0 0 1.0 0 0.9 0 5 4",
            "0 0 1.0 0 0.9 inf 5 4",
            "0 0 NaN 0 0.9 0.003 5 4",
            "0 0 inf 0 0.9 0.003 5 4",
            "0 0 1.0 NaN 0.9 0.003 5 4",
            "0 0 1.0 -inf 0.9 0.003 5 4",
        ] {
            let err = s.read_entity(&mut reader(line), 0).unwrap_err();
            assert!(matches!(err, Error::InvalidSlot { slot: 0, .. }), "{line}: {err}");
            assert_eq!(s.total_synapses(), 0, "{line}");
        }

        s.read_entity(&mut reader("0 0 1.0 0 0.9 0.003 5 4"), 0).unwrap();
        s.queue.schedule_delivery(0, 0, 5);
        s.advance_slot(0, 5, DT);
        assert!(s.base.psr[0].is_finite() && s.base.psr[0] > 0.0);
    }

    #[test]
    fn non_finite_plasticity_state_is_rejected() {
        let mut s = SynapseStore::new(SynapseModel::Dynamic);
        s.setup(1, 1);
        for line in [
            "0 0 1.0 0 0.9 0.003 5 4 0 NaN 0.4 1.1 0.5 0.05",
            "0 0 1.0 0 0.9 0.003 5 4 0 1 inf 1.1 0.5 0.05",
        ] {
            let err = s.read_entity(&mut reader(line), 0).unwrap_err();
            assert!(matches!(err, Error::InvalidSlot { slot: 0, .. }), "{line}: {err}");
        }
        s.read_entity(&mut reader("0 0 1.0 0 0.9 0.003 5 4 0 1 0.4 1.1 0.5 0.05"), 0).unwrap();
        assert_eq!(s.total_synapses(), 1);
    }

    #[test]
    fn free_slot_with_residue_is_rejected() {
        let mut s = SynapseStore::new(SynapseModel::Spiking);
        s.setup(2, 2);
        let err = s.read_entity(&mut reader("0 0 0 0.25 0 0 0 0"), 1).unwrap_err();
        assert!(matches!(err, Error::InvalidSlot { slot: 1, .. }));
    }

    #[test]
    fn truncated_slot_reports_field() {
        let mut s = SynapseStore::new(SynapseModel::Dynamic);
        s.setup(1, 1);
        let err = s.read_entity(&mut reader("0 0 1 0 0.9 0.003 16 4 5 1"), 0).unwrap_err();
        assert!(matches!(err, Error::UnexpectedEof { field: "u" }));
    }

    #[test]
    fn neuron_entities_round_trip() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut neurons = NeuronArrays::new();
        neurons.setup(4, 8, DT);
        let kinds = vec![NeuronKind::Excitatory, NeuronKind::Inhibitory, NeuronKind::Excitatory, NeuronKind::Excitatory];
        neurons.populate(&NeuronParams::default(), &kinds, &[false, false, true, false], &mut rng);
        neurons.refract_remaining[2] = 7;

        let text = encode(&neurons);
        let mut back = NeuronArrays::new();
        back.setup(4, 8, DT);
        back.read_all_entities(&mut reader(&text)).unwrap();

        assert_eq!(back.kind, neurons.kind);
        assert_eq!(back.starter, neurons.starter);
        assert_eq!(back.v_thresh, neurons.v_thresh);
        assert_eq!(back.refract_remaining, neurons.refract_remaining);
        assert_eq!(back.c1, neurons.c1);
        assert_eq!(back.i0, neurons.i0);
    }

    #[test]
    fn header_checks_magic_and_model() {
        let header = CheckpointHeader { neurons: 9, max_per_neuron: 4, model: SynapseModel::Spiking, tick: 123 };
        let mut out = TokenWriter::new(Vec::new());
        header.write(&mut out).unwrap();
        let text = String::from_utf8(out.into_inner()).unwrap();
        assert_eq!(text, "neurogrow-checkpoint 1 9 4 spiking 123\n");
        assert_eq!(CheckpointHeader::read(&mut reader(&text)).unwrap(), header);

        assert!(CheckpointHeader::read(&mut reader("pool 1 9 4 spiking 0")).is_err());
        assert!(matches!(
            CheckpointHeader::read(&mut reader("neurogrow-checkpoint 1 9 4 plastic 0")),
            Err(Error::Malformed { field: "model", .. })
        ));
    }
}
