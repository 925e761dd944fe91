//! tandem-storage: content-addressed attachment store over OpenDAL

pub mod attachment;
pub mod health;
pub mod operator;

pub use attachment::{AttachmentManifest, AttachmentStore};
pub use health::check_health;
pub use operator::build_operator;
