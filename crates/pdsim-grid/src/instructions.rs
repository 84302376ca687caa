//! Instruction streams and the built-in generators.
//!
//! A stream is a flat list of [`Instruction`]s a worker executes for one
//! iteration. Operation sizes come from a [`SizingTable`] derived from the
//! batch token totals and the model shape.

use crate::traits::{BatchEntry, EntryKind, GridError, InstructionGenerator, ModelShape, Placement, WorkerId};
use serde::{Deserialize, Serialize};

/// Compute operations of one decoder layer, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComputeOp {
    LayerNorm,
    QkvProjection,
    RotaryEmbedding,
    Attention,
    OutputProjection,
    Residual,
    FeedForward,
    /// Whole decoder layer as a single fused kernel.
    FusedLayer,
}

const DECODER_LAYER: [ComputeOp; 9] = [
    ComputeOp::LayerNorm,
    ComputeOp::QkvProjection,
    ComputeOp::RotaryEmbedding,
    ComputeOp::Attention,
    ComputeOp::OutputProjection,
    ComputeOp::Residual,
    ComputeOp::LayerNorm,
    ComputeOp::FeedForward,
    ComputeOp::Residual,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instruction {
    /// Announce the batch composition to the worker.
    SetBatch(Vec<BatchEntry>),
    /// Wait for input activations from the memory interface.
    RecvStart { bytes: u64 },
    /// Wait for activations from the previous ring stage.
    RecvFrom { worker: WorkerId, bytes: u64 },
    Compute { op: ComputeOp, elements: u64 },
    /// Forward activations to the next ring stage.
    Send { to: WorkerId, bytes: u64 },
    /// Report completion to the scheduler.
    SendDone,
}

/// Global sizing values substituted into the instruction templates.
///
/// Every entry is clamped to at least 1 so that no operation ends up with a
/// zero dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizingTable {
    /// Batch entries.
    pub b: u64,
    /// Total tokens across the batch.
    pub t: u64,
    /// Hidden width.
    pub c: u64,
    pub nh: u64,
    pub dh: u64,
    /// Query heads per KV head.
    pub r: u64,
    pub three_c: u64,
    pub btc: u64,
    /// Largest prefill chunk in the batch.
    pub chunk: u64,
}

impl SizingTable {
    pub fn from_batch(batch: &[BatchEntry], shape: &ModelShape) -> Self {
        let t: u64 = batch.iter().map(|e| e.tokens as u64).sum();
        let c = shape.hidden();
        let chunk = batch
            .iter()
            .filter(|e| e.kind == EntryKind::Prefill)
            .map(|e| e.tokens as u64)
            .max()
            .unwrap_or(0);
        let r = if shape.kv_heads == 0 {
            0
        } else {
            (shape.attention_heads / shape.kv_heads) as u64
        };
        Self {
            b: at_least_one(batch.len() as u64),
            t: at_least_one(t),
            c: at_least_one(c),
            nh: at_least_one(shape.attention_heads as u64),
            dh: at_least_one(shape.head_size as u64),
            r: at_least_one(r),
            three_c: at_least_one(3 * c),
            btc: at_least_one(t * c),
            chunk: at_least_one(chunk),
        }
    }

    /// Element count an operation touches.
    pub fn elements(&self, op: ComputeOp) -> u64 {
        match op {
            ComputeOp::LayerNorm | ComputeOp::Residual | ComputeOp::OutputProjection => self.btc,
            ComputeOp::QkvProjection => self.t * self.three_c,
            ComputeOp::RotaryEmbedding => self.t * self.nh * self.dh,
            ComputeOp::Attention => self.t * self.chunk * self.nh / self.r,
            ComputeOp::FeedForward => self.btc * 4,
            ComputeOp::FusedLayer => self.btc * 8 + self.t * self.three_c,
        }
    }
}

fn at_least_one(v: u64) -> u64 {
    v.max(1)
}

/// The complete program for one worker and one iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionStream {
    pub worker: WorkerId,
    pub instructions: Vec<Instruction>,
    pub sizing: SizingTable,
}

impl InstructionStream {
    /// The batch announced by the leading `SetBatch`, if any.
    pub fn batch(&self) -> &[BatchEntry] {
        match self.instructions.first() {
            Some(Instruction::SetBatch(entries)) => entries,
            _ => &[],
        }
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Bytes of start data this stream waits for.
    pub fn start_bytes(&self) -> u64 {
        self.instructions
            .iter()
            .map(|i| match i {
                Instruction::RecvStart { bytes } => *bytes,
                _ => 0,
            })
            .sum()
    }
}

/// Start-data payload for the prefill entries of a batch.
pub fn start_payload_bytes(batch: &[BatchEntry], shape: &ModelShape) -> u64 {
    let tokens: u64 = batch
        .iter()
        .filter(|e| e.kind == EntryKind::Prefill)
        .map(|e| e.tokens as u64)
        .sum();
    shape.activation_bytes(tokens)
}

fn build_stream(
    worker: WorkerId,
    batch: &[BatchEntry],
    placement: &Placement,
    shape: &ModelShape,
    ops: &[ComputeOp],
) -> Result<InstructionStream, GridError> {
    if batch.is_empty() {
        return Err(GridError::EmptyBatch(worker));
    }
    let sizing = SizingTable::from_batch(batch, shape);
    let activations = sizing.t * sizing.c * 4;

    let mut instructions = Vec::with_capacity(ops.len() + 4);
    instructions.push(Instruction::SetBatch(batch.to_vec()));
    if placement.admits() {
        let bytes = start_payload_bytes(batch, shape);
        if bytes > 0 {
            instructions.push(Instruction::RecvStart { bytes });
        }
    } else if let Some(prev) = placement.previous {
        instructions.push(Instruction::RecvFrom {
            worker: prev,
            bytes: activations,
        });
    }
    for &op in ops {
        instructions.push(Instruction::Compute {
            op,
            elements: sizing.elements(op),
        });
    }
    if let Some(next) = placement.next {
        instructions.push(Instruction::Send {
            to: next,
            bytes: activations,
        });
    }
    instructions.push(Instruction::SendDone);

    Ok(InstructionStream {
        worker,
        instructions,
        sizing,
    })
}

/// Expands every decoder layer op by op.
#[derive(Debug, Default, Clone)]
pub struct TemplateGenerator;

impl TemplateGenerator {
    pub fn new() -> Self {
        Self
    }
}

impl InstructionGenerator for TemplateGenerator {
    fn name(&self) -> &str {
        "template"
    }

    fn generate(
        &self,
        worker: WorkerId,
        batch: &[BatchEntry],
        placement: &Placement,
        shape: &ModelShape,
    ) -> Result<InstructionStream, GridError> {
        build_stream(worker, batch, placement, shape, &DECODER_LAYER)
    }
}

/// Emits one fused compute instruction per iteration.
#[derive(Debug, Default, Clone)]
pub struct FusedGenerator;

impl FusedGenerator {
    pub fn new() -> Self {
        Self
    }
}

impl InstructionGenerator for FusedGenerator {
    fn name(&self) -> &str {
        "fused"
    }

    fn generate(
        &self,
        worker: WorkerId,
        batch: &[BatchEntry],
        placement: &Placement,
        shape: &ModelShape,
    ) -> Result<InstructionStream, GridError> {
        build_stream(worker, batch, placement, shape, &[ComputeOp::FusedLayer])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape() -> ModelShape {
        ModelShape {
            attention_heads: 8,
            head_size: 64,
            kv_heads: 2,
        }
    }

    #[test]
    fn test_sizing_table_totals() {
        let batch = vec![
            BatchEntry::prefill(0, 96),
            BatchEntry::decode(1),
            BatchEntry::decode(2),
        ];
        let sizing = SizingTable::from_batch(&batch, &shape());
        assert_eq!(sizing.b, 3);
        assert_eq!(sizing.t, 98);
        assert_eq!(sizing.c, 512);
        assert_eq!(sizing.r, 4);
        assert_eq!(sizing.three_c, 1536);
        assert_eq!(sizing.btc, 98 * 512);
        assert_eq!(sizing.chunk, 96);
    }

    #[test]
    fn test_sizing_zero_values_clamped() {
        let batch = vec![BatchEntry::decode(0)];
        let degenerate = ModelShape {
            attention_heads: 0,
            head_size: 0,
            kv_heads: 0,
        };
        let sizing = SizingTable::from_batch(&batch, &degenerate);
        assert_eq!(sizing.c, 1);
        assert_eq!(sizing.nh, 1);
        assert_eq!(sizing.dh, 1);
        assert_eq!(sizing.r, 1);
        // Decode-only batch has no prefill chunk.
        assert_eq!(sizing.chunk, 1);
    }

    #[test]
    fn test_template_stream_layout() {
        let gen = TemplateGenerator::new();
        let batch = vec![BatchEntry::prefill(4, 32)];
        let stream = gen
            .generate(3, &batch, &Placement::standalone(), &shape())
            .unwrap();
        assert_eq!(stream.worker, 3);
        assert_eq!(stream.batch(), batch.as_slice());
        assert_eq!(stream.start_bytes(), 32 * 512 * 4);
        assert_eq!(stream.instructions.last(), Some(&Instruction::SendDone));
        let computes = stream
            .instructions
            .iter()
            .filter(|i| matches!(i, Instruction::Compute { .. }))
            .count();
        assert_eq!(computes, DECODER_LAYER.len());
    }

    #[test]
    fn test_middle_stage_receives_and_forwards() {
        let gen = TemplateGenerator::new();
        let placement = Placement {
            ring_position: 1,
            ring_length: 3,
            previous: Some(0),
            next: Some(2),
        };
        let stream = gen
            .generate(1, &[BatchEntry::decode(0)], &placement, &shape())
            .unwrap();
        assert_eq!(stream.start_bytes(), 0);
        assert!(matches!(
            stream.instructions[1],
            Instruction::RecvFrom { worker: 0, .. }
        ));
        assert!(stream
            .instructions
            .iter()
            .any(|i| matches!(i, Instruction::Send { to: 2, .. })));
    }

    #[test]
    fn test_decode_only_admission_has_no_start_data() {
        let gen = FusedGenerator::new();
        let stream = gen
            .generate(0, &[BatchEntry::decode(7)], &Placement::standalone(), &shape())
            .unwrap();
        assert_eq!(stream.start_bytes(), 0);
        assert_eq!(stream.len(), 3);
    }

    #[test]
    fn test_empty_batch_rejected() {
        let gen = TemplateGenerator::new();
        let err = gen
            .generate(5, &[], &Placement::standalone(), &shape())
            .unwrap_err();
        assert_eq!(err, GridError::EmptyBatch(5));
    }

    #[test]
    fn test_generation_is_deterministic() {
        let gen = TemplateGenerator::new();
        let batch = vec![BatchEntry::prefill(0, 10), BatchEntry::decode(1)];
        let a = gen.generate(0, &batch, &Placement::standalone(), &shape()).unwrap();
        let b = gen.generate(0, &batch, &Placement::standalone(), &shape()).unwrap();
        assert_eq!(a, b);
    }
}
