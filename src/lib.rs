pub mod browser;
pub mod model;
pub mod session;

pub use browser::{Browser, BrowserConfig, PageHandle};
pub use model::{ModelConfig, ResponsesClient, UiAction};
pub use session::{ChromiumBackend, ModelSession, Pilot, PilotConfig, TaskReport, UiBackend};
