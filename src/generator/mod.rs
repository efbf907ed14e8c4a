pub mod singbox;

pub use singbox::{persist_config, synthesize, unique_tag, SynthesisInput};
