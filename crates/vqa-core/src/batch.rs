use tch::{Device, Tensor};

use crate::error::{ModelError, Result};

/// Tensor names used when a batch (or a whole split) is stored on disk.
pub const FIELD_NAMES: [&str; 8] = [
    "features",
    "spatials",
    "image_mask",
    "question",
    "target",
    "input_mask",
    "segment_ids",
    "question_id",
];

/// One batch of paired vision/language examples, batch dimension first.
#[derive(Debug)]
pub struct Batch {
    /// `[B, R, Dv]` region features.
    pub features: Tensor,
    /// `[B, R, 5]` normalised region boxes.
    pub spatials: Tensor,
    /// `[B, R]` 1 for real regions.
    pub image_mask: Tensor,
    /// `[B, T]` token ids.
    pub question: Tensor,
    /// `[B, L]` soft answer scores.
    pub target: Tensor,
    /// `[B, T]` 1 for real tokens.
    pub input_mask: Tensor,
    /// `[B, T]`
    pub segment_ids: Tensor,
    /// `[B]`
    pub question_id: Tensor,
}

/// Borrowed view of the tensors a model consumes.
#[derive(Debug, Clone, Copy)]
pub struct VqaInputs<'a> {
    pub question: &'a Tensor,
    pub features: &'a Tensor,
    pub spatials: &'a Tensor,
    pub segment_ids: &'a Tensor,
    pub input_mask: &'a Tensor,
    pub image_mask: &'a Tensor,
}

impl Batch {
    /// Builds a batch from tensors listed in [`FIELD_NAMES`] order.
    pub fn from_fields(fields: [Tensor; 8]) -> Self {
        let [features, spatials, image_mask, question, target, input_mask, segment_ids, question_id] =
            fields;
        Self {
            features,
            spatials,
            image_mask,
            question,
            target,
            input_mask,
            segment_ids,
            question_id,
        }
    }

    pub fn fields(&self) -> [&Tensor; 8] {
        [
            &self.features,
            &self.spatials,
            &self.image_mask,
            &self.question,
            &self.target,
            &self.input_mask,
            &self.segment_ids,
            &self.question_id,
        ]
    }

    pub fn len(&self) -> i64 {
        self.question.size().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_labels(&self) -> i64 {
        self.target.size().last().copied().unwrap_or(0)
    }

    pub fn device(&self) -> Device {
        self.question.device()
    }

    pub fn inputs(&self) -> VqaInputs<'_> {
        VqaInputs {
            question: &self.question,
            features: &self.features,
            spatials: &self.spatials,
            segment_ids: &self.segment_ids,
            input_mask: &self.input_mask,
            image_mask: &self.image_mask,
        }
    }

    fn map(&self, f: impl Fn(&Tensor) -> Tensor) -> Batch {
        let [a, b, c, d, e, g, h, i] = self.fields();
        Batch::from_fields([f(a), f(b), f(c), f(d), f(e), f(g), f(h), f(i)])
    }

    pub fn to_device(&self, device: Device) -> Batch {
        self.map(|t| t.to_device(device))
    }

    pub fn narrow(&self, start: i64, len: i64) -> Batch {
        self.map(|t| t.narrow(0, start, len))
    }

    /// Splits the batch into at most `parts` contiguous shards whose sizes
    /// differ by at most one example. Empty shards are not produced.
    pub fn shard(&self, parts: usize) -> Vec<Batch> {
        let total = self.len();
        let parts = (parts.max(1) as i64).min(total.max(1));
        let base = total / parts;
        let rem = total % parts;
        let mut start = 0;
        let mut out = Vec::with_capacity(parts as usize);
        for i in 0..parts {
            let len = base + i64::from(i < rem);
            if len > 0 {
                out.push(self.narrow(start, len));
            }
            start += len;
        }
        out
    }

    /// Splits the batch into consecutive pieces of at most `chunk_size` examples.
    pub fn chunks(&self, chunk_size: i64) -> Vec<Batch> {
        let total = self.len();
        let chunk_size = chunk_size.max(1);
        let mut out = Vec::new();
        let mut start = 0;
        while start < total {
            let len = chunk_size.min(total - start);
            out.push(self.narrow(start, len));
            start += len;
        }
        out
    }

    /// Checks that every field agrees on the batch, region and token dimensions.
    pub fn validate(&self) -> Result<()> {
        let b = self.len();
        let features = self.features.size();
        if features.len() != 3 || features[0] != b {
            return Err(shape_error("features", "[B, R, Dv]", features));
        }
        let regions = features[1];
        let tokens = self.question.size();
        if tokens.len() != 2 {
            return Err(shape_error("question", "[B, T]", tokens));
        }
        let t = tokens[1];

        let checks: [(&'static str, &Tensor, Vec<i64>, &str); 6] = [
            ("image_mask", &self.image_mask, vec![b, regions], "[B, R]"),
            ("input_mask", &self.input_mask, vec![b, t], "[B, T]"),
            ("segment_ids", &self.segment_ids, vec![b, t], "[B, T]"),
            ("question_id", &self.question_id, vec![b], "[B]"),
            ("spatials", &self.spatials, vec![b, regions, -1], "[B, R, S]"),
            ("target", &self.target, vec![b, -1], "[B, L]"),
        ];
        for (field, tensor, expected, pattern) in checks {
            let got = tensor.size();
            let matches = got.len() == expected.len()
                && got.iter().zip(&expected).all(|(g, e)| *e < 0 || g == e);
            if !matches {
                return Err(shape_error(field, pattern, got));
            }
        }
        Ok(())
    }
}

fn shape_error(field: &'static str, expected: &str, got: Vec<i64>) -> ModelError {
    ModelError::Shape {
        field,
        expected: expected.to_string(),
        got,
    }
}
