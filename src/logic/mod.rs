pub(crate) mod encoding;
mod mapper;
mod registry;
pub(crate) mod templates;

pub use encoding::EncodingError;
pub use mapper::{MechanismMapper, Purpose};
pub use registry::{MechanismRegistry, VendorDefinition};
