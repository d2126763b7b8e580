use tch::{nn, Kind, Tensor};

use crate::config::ModelConfig;

/// Added to attention scores of padded keys before the softmax.
const MASKED_SCORE: f64 = -10000.0;

/// Bidirectional multi-head self-attention over a padded sequence.
#[derive(Debug)]
pub struct SelfAttention {
    qkv: nn::Linear,
    out_proj: nn::Linear,
    n_head: i64,
    dropout: f64,
}

impl SelfAttention {
    pub fn new(vs: &nn::Path, config: &ModelConfig) -> Self {
        let hidden = config.hidden_size;
        let qkv = nn::linear(vs / "qkv", hidden, 3 * hidden, Default::default());
        let out_proj = nn::linear(vs / "out_proj", hidden, hidden, Default::default());

        Self {
            qkv,
            out_proj,
            n_head: config.num_heads,
            dropout: config.dropout,
        }
    }

    /// Converts a `[B, T]` 1/0 key mask into an additive `[B, 1, 1, T]` bias.
    pub fn mask_bias(mask: &Tensor) -> Tensor {
        let (b, t) = (mask.size()[0], mask.size()[1]);
        (mask.to_kind(Kind::Float) - 1.0).view([b, 1, 1, t]) * -MASKED_SCORE
    }

    /// x: [B, T, C], bias: output of [`SelfAttention::mask_bias`].
    pub fn forward_t(&self, x: &Tensor, bias: &Tensor, train: bool) -> Tensor {
        let size = x.size();
        let (b, t, c) = (size[0], size[1], size[2]);
        let head_size = c / self.n_head;

        let chunks = x.apply(&self.qkv).chunk(3, -1);
        let (q, k, v) = (&chunks[0], &chunks[1], &chunks[2]);

        let q = q.view([b, t, self.n_head, head_size]).transpose(1, 2);
        let k = k.view([b, t, self.n_head, head_size]).transpose(1, 2);
        let v = v.view([b, t, self.n_head, head_size]).transpose(1, 2);

        let att = q.matmul(&k.transpose(-2, -1)) * (1.0 / (head_size as f64).sqrt());
        let att = (att + bias)
            .softmax(-1, Kind::Float)
            .dropout(self.dropout, train);

        att.matmul(&v)
            .transpose(1, 2)
            .contiguous()
            .view([b, t, c])
            .apply(&self.out_proj)
    }
}
