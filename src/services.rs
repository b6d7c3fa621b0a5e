//! Post-fetch services: translation, image deduplication and record assembly.

pub mod image_dedup;
pub mod record_assembler;
pub mod translation;

pub use image_dedup::{ImageAsset, ImageDeduplicator, ImageOccurrence, ImageOutcome};
pub use record_assembler::RecordAssembler;
pub use translation::{TranslatedProduct, Translation, TranslationCache, TranslationPipeline, TranslationStatus};
