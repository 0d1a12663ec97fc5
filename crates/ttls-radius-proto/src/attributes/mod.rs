mod attribute;
mod types;

pub use attribute::{Attribute, VendorSpecific};
pub use types::AttributeType;
