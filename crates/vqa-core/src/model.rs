use std::fmt::Debug;

use tch::{nn, Kind, Tensor};

use crate::batch::VqaInputs;
use crate::config::{ModelConfig, ModelKind};
use crate::encoder::Encoder;
use crate::layer_norm::RMSNorm;

/// A question-answering model producing one logit per answer candidate.
///
/// Parameters live in the `nn::VarStore` the model was built from; the store,
/// not the model, is what gets enumerated, copied and checkpointed.
pub trait VqaModel: Send + Sync + Debug {
    /// Returns `[B, num_labels]` logits. `train` toggles dropout.
    fn forward_t(&self, inputs: VqaInputs<'_>, train: bool) -> Tensor;

    fn num_labels(&self) -> i64;

    fn kind(&self) -> ModelKind;
}

/// Builds the variant selected by `kind` under `vs`.
pub fn build_model(
    kind: ModelKind,
    vs: &nn::Path,
    config: &ModelConfig,
    num_labels: i64,
) -> Box<dyn VqaModel> {
    match kind {
        ModelKind::TwoStream => Box::new(TwoStreamVqa::new(vs, config, num_labels)),
        ModelKind::SingleStream => Box::new(SingleStreamVqa::new(vs, config, num_labels)),
    }
}

/// Word + position + segment embeddings.
#[derive(Debug)]
struct TextEmbeddings {
    word: nn::Embedding,
    position: nn::Embedding,
    segment: nn::Embedding,
    norm: RMSNorm,
    dropout: f64,
}

impl TextEmbeddings {
    fn new(vs: &nn::Path, config: &ModelConfig) -> Self {
        let h = config.hidden_size;
        Self {
            word: nn::embedding(vs / "word", config.vocab_size, h, Default::default()),
            position: nn::embedding(vs / "position", config.max_position_embeddings, h, Default::default()),
            segment: nn::embedding(vs / "segment", config.type_vocab_size, h, Default::default()),
            norm: RMSNorm::new(&(vs / "norm"), h, config.layer_norm_epsilon),
            dropout: config.dropout,
        }
    }

    fn forward_t(&self, question: &Tensor, segment_ids: &Tensor, train: bool) -> Tensor {
        let t = question.size()[1];
        let positions = Tensor::arange(t, (Kind::Int64, question.device())).unsqueeze(0);
        let x = question.apply(&self.word) + positions.apply(&self.position) + segment_ids.apply(&self.segment);
        self.norm.forward(&x).dropout(self.dropout, train)
    }
}

/// Projects region features and region boxes into the hidden width.
#[derive(Debug)]
struct VisualEmbeddings {
    feature: nn::Linear,
    spatial: nn::Linear,
    norm: RMSNorm,
    dropout: f64,
}

impl VisualEmbeddings {
    fn new(vs: &nn::Path, config: &ModelConfig) -> Self {
        let h = config.hidden_size;
        Self {
            feature: nn::linear(vs / "feature", config.v_feature_size, h, Default::default()),
            spatial: nn::linear(vs / "spatial", config.v_spatial_size, h, Default::default()),
            norm: RMSNorm::new(&(vs / "norm"), h, config.layer_norm_epsilon),
            dropout: config.dropout,
        }
    }

    fn forward_t(&self, features: &Tensor, spatials: &Tensor, train: bool) -> Tensor {
        let x = features.to_kind(Kind::Float).apply(&self.feature)
            + spatials.to_kind(Kind::Float).apply(&self.spatial);
        self.norm.forward(&x).dropout(self.dropout, train)
    }
}

/// `tanh(W x)` over a pooled vector.
#[derive(Debug)]
struct Pooler {
    dense: nn::Linear,
}

impl Pooler {
    fn new(vs: &nn::Path, h: i64) -> Self {
        Self {
            dense: nn::linear(vs / "dense", h, h, Default::default()),
        }
    }

    fn forward(&self, x: &Tensor) -> Tensor {
        x.apply(&self.dense).tanh()
    }
}

/// Two-layer answer classifier.
#[derive(Debug)]
struct Classifier {
    hidden: nn::Linear,
    norm: RMSNorm,
    out: nn::Linear,
    dropout: f64,
}

impl Classifier {
    fn new(vs: &nn::Path, config: &ModelConfig, num_labels: i64) -> Self {
        let h = config.hidden_size;
        Self {
            hidden: nn::linear(vs / "hidden", h, 2 * h, Default::default()),
            norm: RMSNorm::new(&(vs / "norm"), 2 * h, config.layer_norm_epsilon),
            out: nn::linear(vs / "out", 2 * h, num_labels, Default::default()),
            dropout: config.dropout,
        }
    }

    fn forward_t(&self, x: &Tensor, train: bool) -> Tensor {
        let x = x.apply(&self.hidden).gelu("none").unsqueeze(1);
        self.norm
            .forward(&x)
            .squeeze_dim(1)
            .dropout(self.dropout, train)
            .apply(&self.out)
    }
}

/// Mean over positions whose mask is 1. x: [B, T, C], mask: [B, T].
fn masked_mean(x: &Tensor, mask: &Tensor) -> Tensor {
    let mask = mask.to_kind(Kind::Float).unsqueeze(-1);
    let summed = (x * &mask).sum_dim_intlist(Some(&[1][..]), false, Kind::Float);
    let count = mask.sum_dim_intlist(Some(&[1][..]), false, Kind::Float).clamp_min(1.0);
    summed / count
}

/// Separate text and region encoders, fused by an elementwise product of
/// their pooled outputs.
#[derive(Debug)]
pub struct TwoStreamVqa {
    text_embeddings: TextEmbeddings,
    text_encoder: Encoder,
    text_pooler: Pooler,
    visual_embeddings: VisualEmbeddings,
    visual_encoder: Encoder,
    visual_pooler: Pooler,
    classifier: Classifier,
    num_labels: i64,
}

impl TwoStreamVqa {
    pub fn new(vs: &nn::Path, config: &ModelConfig, num_labels: i64) -> Self {
        let h = config.hidden_size;
        Self {
            text_embeddings: TextEmbeddings::new(&(vs / "text_embeddings"), config),
            text_encoder: Encoder::new(&(vs / "text_encoder"), config, config.text_layers),
            text_pooler: Pooler::new(&(vs / "text_pooler"), h),
            visual_embeddings: VisualEmbeddings::new(&(vs / "visual_embeddings"), config),
            visual_encoder: Encoder::new(&(vs / "visual_encoder"), config, config.visual_layers),
            visual_pooler: Pooler::new(&(vs / "visual_pooler"), h),
            classifier: Classifier::new(&(vs / "classifier"), config, num_labels),
            num_labels,
        }
    }
}

impl VqaModel for TwoStreamVqa {
    fn forward_t(&self, inputs: VqaInputs<'_>, train: bool) -> Tensor {
        let text = self
            .text_embeddings
            .forward_t(inputs.question, inputs.segment_ids, train);
        let text = self.text_encoder.forward_t(&text, inputs.input_mask, train);
        let pooled_text = self.text_pooler.forward(&text.select(1, 0));

        let visual = self
            .visual_embeddings
            .forward_t(inputs.features, inputs.spatials, train);
        let visual = self.visual_encoder.forward_t(&visual, inputs.image_mask, train);
        let pooled_visual = self
            .visual_pooler
            .forward(&masked_mean(&visual, inputs.image_mask));

        self.classifier.forward_t(&(pooled_text * pooled_visual), train)
    }

    fn num_labels(&self) -> i64 {
        self.num_labels
    }

    fn kind(&self) -> ModelKind {
        ModelKind::TwoStream
    }
}

/// Baseline: text tokens followed by image regions in one encoder.
#[derive(Debug)]
pub struct SingleStreamVqa {
    text_embeddings: TextEmbeddings,
    visual_embeddings: VisualEmbeddings,
    encoder: Encoder,
    pooler: Pooler,
    classifier: Classifier,
    num_labels: i64,
}

impl SingleStreamVqa {
    pub fn new(vs: &nn::Path, config: &ModelConfig, num_labels: i64) -> Self {
        Self {
            text_embeddings: TextEmbeddings::new(&(vs / "text_embeddings"), config),
            visual_embeddings: VisualEmbeddings::new(&(vs / "visual_embeddings"), config),
            encoder: Encoder::new(&(vs / "encoder"), config, config.text_layers),
            pooler: Pooler::new(&(vs / "pooler"), config.hidden_size),
            classifier: Classifier::new(&(vs / "classifier"), config, num_labels),
            num_labels,
        }
    }
}

impl VqaModel for SingleStreamVqa {
    fn forward_t(&self, inputs: VqaInputs<'_>, train: bool) -> Tensor {
        let text = self
            .text_embeddings
            .forward_t(inputs.question, inputs.segment_ids, train);
        let visual = self
            .visual_embeddings
            .forward_t(inputs.features, inputs.spatials, train);
        let x = Tensor::cat(&[text, visual], 1);
        let mask = Tensor::cat(
            &[
                inputs.input_mask.to_kind(Kind::Float),
                inputs.image_mask.to_kind(Kind::Float),
            ],
            1,
        );

        let x = self.encoder.forward_t(&x, &mask, train);
        let pooled = self.pooler.forward(&x.select(1, 0));
        self.classifier.forward_t(&pooled, train)
    }

    fn num_labels(&self) -> i64 {
        self.num_labels
    }

    fn kind(&self) -> ModelKind {
        ModelKind::SingleStream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::tests::random_batch;
    use tch::Device;

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            hidden_size: 16,
            num_heads: 2,
            text_layers: 1,
            visual_layers: 1,
            vocab_size: 100,
            max_position_embeddings: 16,
            v_feature_size: 8,
            dropout: 0.0,
            ..ModelConfig::default()
        }
    }

    #[test]
    fn factory_builds_requested_variant_with_logits_per_label() {
        let batch = random_batch(3, 4, 5, 7, 8);
        for kind in [ModelKind::TwoStream, ModelKind::SingleStream] {
            let vs = nn::VarStore::new(Device::Cpu);
            let model = build_model(kind, &vs.root(), &tiny_config(), 7);
            assert_eq!(model.kind(), kind);
            assert_eq!(model.forward_t(batch.inputs(), false).size(), vec![3, 7]);
        }
    }

    #[test]
    fn variants_register_distinct_parameter_sets() {
        let vs_two = nn::VarStore::new(Device::Cpu);
        let _two = build_model(ModelKind::TwoStream, &vs_two.root(), &tiny_config(), 7);
        let vs_one = nn::VarStore::new(Device::Cpu);
        let _one = build_model(ModelKind::SingleStream, &vs_one.root(), &tiny_config(), 7);

        let two = vs_two.variables();
        let one = vs_one.variables();
        assert!(two.keys().any(|k| k.starts_with("visual_encoder.")));
        assert!(!one.keys().any(|k| k.starts_with("visual_encoder.")));
        assert!(one.contains_key("classifier.out.weight"));
    }

    #[test]
    fn inference_mode_is_deterministic_with_dropout() {
        let config = ModelConfig {
            dropout: 0.5,
            ..tiny_config()
        };
        let vs = nn::VarStore::new(Device::Cpu);
        let model = build_model(ModelKind::TwoStream, &vs.root(), &config, 5);
        let batch = random_batch(2, 3, 4, 5, 8);

        let a = model.forward_t(batch.inputs(), false);
        let b = model.forward_t(batch.inputs(), false);
        assert!(a.equal(&b));
    }
}
