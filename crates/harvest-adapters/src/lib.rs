//! Navigation capability contract, the HTTP/HTML navigator, and the field
//! extractor that turns rendered product text into offer fields.

pub mod extract;
pub mod html;
pub mod navigator;

pub use extract::{is_header_text, ExtractedFields, FieldExtractor};
pub use html::{parse_page, HtmlNavigator, ParsedPage, PRODUCT_SELECTORS};
pub use navigator::{CandidateElement, NavigationError, Navigator};

pub const CRATE_NAME: &str = "harvest-adapters";
