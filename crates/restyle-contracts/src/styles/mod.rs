mod catalog;

pub use catalog::{StyleCatalog, StyleDescriptor, IDENTITY_STYLE_ID};
