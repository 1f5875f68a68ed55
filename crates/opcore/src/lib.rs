pub use linkme;

pub mod attr;
pub mod autograd;
pub mod config;
pub mod device;
mod env;
pub mod error;
pub mod functional;
pub mod kernel;
pub mod op;
pub mod registry;
pub mod tensor;

pub use attr::{AttrMap, AttrValue, ComposedAttrMap};
pub use error::{ErrorKind, OpError, Result};
pub use op::{OpExpr, OpSchema, UserOpExpr};
pub use tensor::{DType, GradTuple, Shape, Tensor, TensorDesc, TensorTuple};
