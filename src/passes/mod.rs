//! Built-in passes, registered by [`crate::pass::PassRegistry::with_builtin_passes`].
mod fix_info;
mod fold;
mod fuse_matmul_add;
mod remove_identity;

pub use fix_info::PropagateFixInfo;
pub use fold::ConstFold;
pub use fuse_matmul_add::{FuseMatMulAdd, MATMUL_ADD_OP};
pub use remove_identity::RemoveIdentity;

pub const REMOVE_IDENTITY: &str = "remove_identity";
pub const CONST_FOLD: &str = "const_fold";
pub const PROPAGATE_FIX_INFO: &str = "propagate_fix_info";
pub const FUSE_MATMUL_ADD: &str = "fuse_matmul_add";
