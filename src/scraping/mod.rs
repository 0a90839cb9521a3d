pub mod browser_manager;
pub mod cdp_dom;
pub mod dom;

pub use cdp_dom::CdpDom;
pub use dom::{ClearTechnique, DomDriver, DomError, ElementSnapshot, Rect};
