use tch::{nn, Tensor};

use crate::attention::SelfAttention;
use crate::config::ModelConfig;
use crate::layer_norm::RMSNorm;

/// FeedForward block (MLP)
#[derive(Debug)]
pub struct MLP {
    fc: nn::Linear,
    proj: nn::Linear,
    dropout: f64,
}

impl MLP {
    pub fn new(vs: &nn::Path, config: &ModelConfig) -> Self {
        let hidden = config.hidden_size;
        let inner = 4 * hidden;

        let fc = nn::linear(vs / "fc", hidden, inner, Default::default());
        let proj = nn::linear(vs / "proj", inner, hidden, Default::default());

        Self {
            fc,
            proj,
            dropout: config.dropout,
        }
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Tensor {
        x.apply(&self.fc)
            .gelu("none")
            .apply(&self.proj)
            .dropout(self.dropout, train)
    }
}

/// Pre-norm encoder layer.
#[derive(Debug)]
pub struct Block {
    norm_1: RMSNorm,
    attn: SelfAttention,
    norm_2: RMSNorm,
    mlp: MLP,
}

impl Block {
    pub fn new(vs: &nn::Path, config: &ModelConfig) -> Self {
        let eps = config.layer_norm_epsilon;
        Self {
            norm_1: RMSNorm::new(&(vs / "norm_1"), config.hidden_size, eps),
            attn: SelfAttention::new(&(vs / "attn"), config),
            norm_2: RMSNorm::new(&(vs / "norm_2"), config.hidden_size, eps),
            mlp: MLP::new(&(vs / "mlp"), config),
        }
    }

    pub fn forward_t(&self, x: &Tensor, bias: &Tensor, train: bool) -> Tensor {
        let x = x + self.attn.forward_t(&self.norm_1.forward(x), bias, train);
        let mlp_out = self.mlp.forward_t(&self.norm_2.forward(&x), train);
        x + mlp_out
    }
}

/// Stack of [`Block`]s followed by a final norm.
#[derive(Debug)]
pub struct Encoder {
    blocks: Vec<Block>,
    norm_f: RMSNorm,
}

impl Encoder {
    pub fn new(vs: &nn::Path, config: &ModelConfig, n_layer: i64) -> Self {
        let blocks = (0..n_layer)
            .map(|i| Block::new(&(vs / "layer" / i), config))
            .collect();
        let norm_f = RMSNorm::new(&(vs / "norm_f"), config.hidden_size, config.layer_norm_epsilon);
        Self { blocks, norm_f }
    }

    /// x: [B, T, C]; mask: [B, T] with 1 for positions that may be attended to.
    pub fn forward_t(&self, x: &Tensor, mask: &Tensor, train: bool) -> Tensor {
        let bias = SelfAttention::mask_bias(mask);
        let x = self
            .blocks
            .iter()
            .fold(x.shallow_clone(), |x, block| block.forward_t(&x, &bias, train));
        self.norm_f.forward(&x)
    }
}
