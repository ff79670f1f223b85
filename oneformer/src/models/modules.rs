mod deformable_attention;
mod deformable_sampler;
mod init;
mod position_embedding;

pub use deformable_attention::*;
pub use deformable_sampler::*;
pub use init::ComponentTag;
pub use position_embedding::*;
