//! Model catalog
//!
//! Static registry of the vision-language model variants this build knows how
//! to fetch, load and prompt. Entries are created once at start-up and never
//! mutated afterwards.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use common::error::{Error, Result};

const HF_BASE_URL: &str = "https://huggingface.co";

/// Prompt conventions of a model family.
///
/// Each family renders its own chat template around the image marker and the
/// instruction, and knows which sequences end its turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PromptFamily {
    /// `<|im_start|>` / `<|im_end|>` turns (Qwen-VL, MiniCPM-V)
    ChatMl,
    /// `USER:` / `ASSISTANT:` turns (LLaVA 1.5)
    Vicuna,
    /// `[INST]` / `[/INST]` turns (LLaVA 1.6 Mistral)
    MistralInstruct,
    /// `<start_of_turn>` / `<end_of_turn>` turns (Gemma 3)
    Gemma,
}

impl PromptFamily {
    /// Every family, in catalog order
    pub const ALL: [PromptFamily; 4] = [
        PromptFamily::ChatMl,
        PromptFamily::Vicuna,
        PromptFamily::MistralInstruct,
        PromptFamily::Gemma,
    ];

    /// Template with `{image}` and `{instruction}` placeholders
    pub fn template(&self) -> &'static str {
        match self {
            PromptFamily::ChatMl => {
                "<|im_start|>system\nYou are a helpful assistant.<|im_end|>\n\
                 <|im_start|>user\n{image}\n{instruction}<|im_end|>\n\
                 <|im_start|>assistant\n"
            }
            PromptFamily::Vicuna => {
                "A chat between a curious human and an artificial intelligence assistant. \
                 The assistant gives helpful, detailed, and polite answers to the human's questions.\n\
                 USER: {image}\n{instruction}\nASSISTANT:"
            }
            PromptFamily::MistralInstruct => "[INST] {image}\n{instruction} [/INST]",
            PromptFamily::Gemma => {
                "<start_of_turn>user\n{image}\n{instruction}<end_of_turn>\n<start_of_turn>model\n"
            }
        }
    }

    /// Renders the full prompt for one image
    pub fn render(&self, instruction: &str, image_marker: &str) -> String {
        self.template()
            .replace("{image}", image_marker)
            .replace("{instruction}", instruction.trim())
    }

    /// Sequences whose appearance ends generation
    pub fn stop_sequences(&self) -> &'static [&'static str] {
        match self {
            PromptFamily::ChatMl => &["<|im_end|>", "<|endoftext|>", "<|im_start|>"],
            PromptFamily::Vicuna => &["</s>", "USER:"],
            PromptFamily::MistralInstruct => &["</s>", "[INST]"],
            PromptFamily::Gemma => &["<end_of_turn>", "<eos>", "<start_of_turn>"],
        }
    }

    /// Control tokens that may leak into generated text
    pub fn control_tokens(&self) -> &'static [&'static str] {
        match self {
            PromptFamily::ChatMl => &["<|im_start|>", "<|im_end|>", "<|endoftext|>"],
            PromptFamily::Vicuna => &["<s>", "</s>"],
            PromptFamily::MistralInstruct => &["<s>", "</s>", "[INST]", "[/INST]"],
            PromptFamily::Gemma => &["<bos>", "<eos>", "<start_of_turn>", "<end_of_turn>"],
        }
    }
}

impl fmt::Display for PromptFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptFamily::ChatMl => write!(f, "chatml"),
            PromptFamily::Vicuna => write!(f, "vicuna"),
            PromptFamily::MistralInstruct => write!(f, "mistral-instruct"),
            PromptFamily::Gemma => write!(f, "gemma"),
        }
    }
}

/// One downloadable file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSpec {
    /// File name under the models directory
    pub file_name: String,

    /// Remote location
    pub url: String,

    /// Expected size in bytes
    pub expected_size: u64,
}

impl ArtifactSpec {
    fn hugging_face(repo: &str, remote_name: &str, file_name: String, expected_size: u64) -> Self {
        Self {
            file_name,
            url: format!("{}/{}/resolve/main/{}", HF_BASE_URL, repo, remote_name),
            expected_size,
        }
    }

    /// Local path of this artifact
    pub fn local_path(&self, models_dir: &Path) -> PathBuf {
        models_dir.join(&self.file_name)
    }
}

/// A supported model variant: quantized weights plus multimodal projector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelVariant {
    /// Catalog key
    pub id: String,

    /// Display name
    pub display_name: String,

    /// One-line description
    pub description: String,

    /// Prompt conventions
    pub family: PromptFamily,

    /// Language model weights
    pub weights: ArtifactSpec,

    /// Multimodal projector
    pub projector: ArtifactSpec,
}

impl ModelVariant {
    /// Builds a variant hosted on the Hugging Face hub
    #[allow(clippy::too_many_arguments)]
    pub fn hosted(
        id: &str,
        display_name: &str,
        description: &str,
        family: PromptFamily,
        repo: &str,
        weights_file: &str,
        weights_size: u64,
        projector_file: &str,
        projector_size: u64,
    ) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            description: description.to_string(),
            family,
            weights: ArtifactSpec::hugging_face(repo, weights_file, format!("{}.gguf", id), weights_size),
            projector: ArtifactSpec::hugging_face(
                repo,
                projector_file,
                format!("{}.mmproj.gguf", id),
                projector_size,
            ),
        }
    }

    /// Local weights path
    pub fn weights_path(&self, models_dir: &Path) -> PathBuf {
        self.weights.local_path(models_dir)
    }

    /// Local projector path
    pub fn projector_path(&self, models_dir: &Path) -> PathBuf {
        self.projector.local_path(models_dir)
    }

    /// Combined expected size of both artifacts
    pub fn expected_total_size(&self) -> u64 {
        self.weights.expected_size + self.projector.expected_size
    }

    /// Renders this variant's prompt for one image
    pub fn render_prompt(&self, instruction: &str, image_marker: &str) -> String {
        self.family.render(instruction, image_marker)
    }

    /// Stop sequences for this variant
    pub fn stop_sequences(&self) -> &'static [&'static str] {
        self.family.stop_sequences()
    }
}

/// Read-only lookup table of model variants
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    variants: Vec<ModelVariant>,
}

impl ModelCatalog {
    /// Creates a catalog from explicit entries
    pub fn new(variants: Vec<ModelVariant>) -> Result<Self> {
        let mut ids = HashSet::new();
        let mut files = HashSet::new();

        for variant in &variants {
            if variant.id.trim().is_empty() {
                return Err(Error::Configuration("variant id must not be empty".to_string()));
            }
            if !ids.insert(variant.id.as_str()) {
                return Err(Error::Configuration(format!("duplicate variant id {}", variant.id)));
            }
            for artifact in [&variant.weights, &variant.projector] {
                if !files.insert(artifact.file_name.as_str()) {
                    return Err(Error::Configuration(format!(
                        "artifact file {} is claimed by more than one variant",
                        artifact.file_name
                    )));
                }
            }
        }

        Ok(Self { variants })
    }

    /// The variants shipped with this build
    pub fn builtin() -> Self {
        Self {
            variants: vec![
                ModelVariant::hosted(
                    "qwen2.5-vl-3b",
                    "Qwen2.5-VL 3B",
                    "Small and fast; good default for large datasets",
                    PromptFamily::ChatMl,
                    "ggml-org/Qwen2.5-VL-3B-Instruct-GGUF",
                    "Qwen2.5-VL-3B-Instruct-Q4_K_M.gguf",
                    1_929_903_264,
                    "mmproj-Qwen2.5-VL-3B-Instruct-f16.gguf",
                    1_338_427_392,
                ),
                ModelVariant::hosted(
                    "qwen2.5-vl-7b",
                    "Qwen2.5-VL 7B",
                    "Most detailed captions; needs about 8 GB of VRAM",
                    PromptFamily::ChatMl,
                    "ggml-org/Qwen2.5-VL-7B-Instruct-GGUF",
                    "Qwen2.5-VL-7B-Instruct-Q4_K_M.gguf",
                    4_683_073_248,
                    "mmproj-Qwen2.5-VL-7B-Instruct-f16.gguf",
                    1_354_163_040,
                ),
                ModelVariant::hosted(
                    "llava-1.5-7b",
                    "LLaVA 1.5 7B",
                    "Classic LLaVA; short, literal captions",
                    PromptFamily::Vicuna,
                    "mys/ggml_llava-v1.5-7b",
                    "ggml-model-q4_k.gguf",
                    4_081_004_224,
                    "mmproj-model-f16.gguf",
                    624_434_368,
                ),
                ModelVariant::hosted(
                    "llava-1.6-mistral-7b",
                    "LLaVA 1.6 Mistral 7B",
                    "Higher resolution LLaVA on a Mistral backbone",
                    PromptFamily::MistralInstruct,
                    "cjpais/llava-1.6-mistral-7b-gguf",
                    "llava-v1.6-mistral-7b.Q4_K_M.gguf",
                    4_368_438_944,
                    "mmproj-model-f16.gguf",
                    624_434_368,
                ),
                ModelVariant::hosted(
                    "gemma-3-4b",
                    "Gemma 3 4B",
                    "Balanced quality and speed with natural phrasing",
                    PromptFamily::Gemma,
                    "ggml-org/gemma-3-4b-it-GGUF",
                    "gemma-3-4b-it-Q4_K_M.gguf",
                    2_489_757_856,
                    "mmproj-model-f16.gguf",
                    851_251_104,
                ),
            ],
        }
    }

    /// Looks up a variant by id
    pub fn get(&self, id: &str) -> Result<&ModelVariant> {
        self.variants
            .iter()
            .find(|variant| variant.id == id)
            .ok_or_else(|| Error::Configuration(format!("unknown model variant '{}'", id)))
    }

    /// All variants in catalog order
    pub fn variants(&self) -> &[ModelVariant] {
        &self.variants
    }

    /// All variant ids in catalog order
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.variants.iter().map(|variant| variant.id.as_str())
    }

    /// Number of variants
    pub fn len(&self) -> usize {
        self.variants.len()
    }

    /// Returns true if the catalog has no entries
    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog_is_consistent() {
        let builtin = ModelCatalog::builtin();
        let rebuilt = ModelCatalog::new(builtin.variants().to_vec()).unwrap();
        assert_eq!(rebuilt.len(), 5);

        for variant in builtin.variants() {
            assert!(variant.weights.url.starts_with("https://huggingface.co/"));
            assert!(variant.projector.expected_size < variant.weights.expected_size);
            assert!(!variant.stop_sequences().is_empty());
        }
    }

    #[test]
    fn test_unknown_variant_is_configuration_error() {
        let catalog = ModelCatalog::builtin();
        let err = catalog.get("gpt-vision-9000").unwrap_err();
        assert!(err.is_configuration());
        assert!(catalog.get("gemma-3-4b").is_ok());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let variant = ModelCatalog::builtin().get("qwen2.5-vl-3b").unwrap().clone();
        let err = ModelCatalog::new(vec![variant.clone(), variant]).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_chatml_render() {
        let prompt = PromptFamily::ChatMl.render("  Describe it.  ", "<__media__>");
        assert!(prompt.contains("<|im_start|>user\n<__media__>\nDescribe it.<|im_end|>"));
        assert!(prompt.ends_with("<|im_start|>assistant\n"));
        assert!(!prompt.contains("{image}"));
        assert!(!prompt.contains("{instruction}"));
    }

    #[test]
    fn test_every_family_places_marker_and_instruction() {
        for family in PromptFamily::ALL {
            let prompt = family.render("caption this", "<img>");
            let marker = prompt.find("<img>").unwrap();
            let instruction = prompt.find("caption this").unwrap();
            assert!(marker < instruction, "{} puts the image first", family);
        }
    }

    #[test]
    fn test_paths() {
        let variant = ModelCatalog::builtin().get("llava-1.5-7b").unwrap().clone();
        let dir = Path::new("/models");
        assert_eq!(variant.weights_path(dir), PathBuf::from("/models/llava-1.5-7b.gguf"));
        assert_eq!(
            variant.projector_path(dir),
            PathBuf::from("/models/llava-1.5-7b.mmproj.gguf")
        );
    }
}
