pub mod model;
pub mod pipeline;
pub mod tensor;
pub mod tokenizer;

pub use model::{Hyperparameters, ModelDescriptor, TensorCatalog, TensorRecord, TokenId};
pub use pipeline::{ComputePipeline, PlaceholderPipeline, Scratch};
pub use tensor::{Tensor, TensorOps};
pub use tokenizer::{Tokenizer, Vocabulary, WordTokenizer};
