pub mod images;
pub mod llm;
pub mod store;

pub use images::{BackgroundConverterPool, ConvertImage, ImageConversionCache, ImageConverter};
pub use llm::{ModelClient, ModelReply, OpenAiClient};
pub use store::{
    InterpretationStore, JsonFilePostSource, JsonFileStore, MemoryPostSource, MemoryStore,
    PostSource, StoreStats,
};
