pub mod client;
pub mod prompts;

pub use client::{ModelClient, ModelReply, OpenAiClient};
pub use prompts::{text_prompt, vision_prompt};
