// Template resolution and materialization: fetch raw source from the store,
// compile it against the request data into HTML. No browser involvement here.

pub mod compiler;
pub mod store;

pub use compiler::{CompileError, HelperRegistry, TemplateCompiler};
pub use store::{FsTemplateStore, S3TemplateStore, StoreError, TemplateStore};
