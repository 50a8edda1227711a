use anyhow::Result;
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams, DispatchMouseEventType,
    InsertTextParams, MouseButton,
};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::layout::Point;
use chromiumoxide::page::{Page, ScreenshotParamsBuilder};
use futures::StreamExt;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::model::{PointerButton, TOOL_DISPLAY};

/// Stable identity of one open tab, valid for the whole browser session.
/// Wraps the CDP target id so callers never hold a live page object.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PageHandle(String);

impl PageHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone)]
pub struct BrowserConfig {
    pub headless: bool,
    pub user_agent: Option<String>,
    pub viewport: (u32, u32),
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self { headless: true, user_agent: None, viewport: TOOL_DISPLAY }
    }
}

pub struct Browser {
    browser: OxideBrowser,
    // open tabs in first-seen order, so the most recently opened is last
    pages: Mutex<Vec<Page>>,
    viewport: (u32, u32),
}

impl Browser {
    pub async fn launch(cfg: BrowserConfig) -> Result<Self> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // Use a unique user data dir per run to avoid ProcessSingleton profile lock conflicts
        // observed when Chromium is restarted rapidly or multiple instances are spawned.
        let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis();
        let mut profile_dir: PathBuf = std::env::temp_dir();
        profile_dir.push(format!("pagehand-profile-{}-{}", std::process::id(), ts));
        let _ = std::fs::create_dir_all(&profile_dir);
        builder = builder
            .user_data_dir(profile_dir.clone())
            .window_size(cfg.viewport.0, cfg.viewport.1)
            .arg(format!("--user-data-dir={}", profile_dir.display()))
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-extensions")
            .arg("--disable-file-system");
        let bcfg = builder.build().map_err(|e| anyhow::anyhow!(e))?;
        let (browser, mut handler) = OxideBrowser::launch(bcfg).await?;
        tokio::spawn(async move {
            while let Some(_ev) = handler.next().await {}
        });
        let page = browser.new_page("about:blank").await?;
        if let Some(ua) = cfg.user_agent {
            page.set_user_agent(ua).await?;
        }
        let out = Self { browser, pages: Mutex::new(Vec::new()), viewport: cfg.viewport };
        out.apply_viewport(&page).await;
        out.pages.lock().await.push(page);
        Ok(out)
    }

    /// Attach to an already running Chromium over its devtools websocket.
    pub async fn connect(ws_url: &str) -> Result<Self> {
        let (browser, mut handler) = OxideBrowser::connect(ws_url).await?;
        tokio::spawn(async move {
            while let Some(_ev) = handler.next().await {}
        });
        let out = Self { browser, pages: Mutex::new(Vec::new()), viewport: TOOL_DISPLAY };
        out.refresh().await?;
        if out.pages.lock().await.is_empty() {
            let page = out.browser.new_page("about:blank").await?;
            out.apply_viewport(&page).await;
            out.pages.lock().await.push(page);
        }
        Ok(out)
    }

    // Screenshots are reported to the model at a fixed size; keep every tab's
    // device metrics in lockstep or clicks land on the wrong pixels. Also
    // guards against the 0-width viewport some headless launches start with.
    async fn apply_viewport(&self, page: &Page) {
        let _ = page
            .execute(
                SetDeviceMetricsOverrideParams::builder()
                    .width(self.viewport.0 as i64)
                    .height(self.viewport.1 as i64)
                    .device_scale_factor(1.0)
                    .mobile(false)
                    .build()
                    .unwrap(),
            )
            .await;
    }

    /// Reconciles the registry with the tabs Chromium currently reports:
    /// closed tabs drop out, new ones append. Enumeration order from CDP is
    /// not reliable, so insertion order is what keeps "newest last" true.
    async fn refresh(&self) -> Result<Vec<Page>> {
        let current = self.browser.pages().await?;
        let mut known = self.pages.lock().await;
        known.retain(|have| current.iter().any(|page| page.target_id() == have.target_id()));
        for page in current {
            if known.iter().all(|have| have.target_id() != page.target_id()) {
                self.apply_viewport(&page).await;
                known.push(page);
            }
        }
        Ok(known.clone())
    }

    pub async fn surfaces(&self) -> Result<Vec<PageHandle>> {
        Ok(self.refresh().await?.iter().map(handle_of).collect())
    }

    async fn page(&self, surface: &PageHandle) -> Result<Page> {
        let known = self.pages.lock().await;
        known
            .iter()
            .find(|page| page.target_id().inner().as_str() == surface.id())
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown surface {surface}"))
    }

    pub async fn navigate(&self, surface: &PageHandle, url: &str) -> Result<()> {
        let page = self.page(surface).await?;
        page.goto(url).await?;
        page.wait_for_navigation().await?;
        Ok(())
    }

    pub async fn move_pointer(&self, surface: &PageHandle, x: i64, y: i64) -> Result<()> {
        let page = self.page(surface).await?;
        page.move_mouse(Point { x: x as f64, y: y as f64 }).await?;
        Ok(())
    }

    pub async fn click(&self, surface: &PageHandle, x: i64, y: i64, button: PointerButton) -> Result<()> {
        let page = self.page(surface).await?;
        let btn = match button {
            PointerButton::Right => MouseButton::Right,
            PointerButton::Middle => MouseButton::Middle,
            PointerButton::Left => MouseButton::Left,
        };
        // custom dispatch to honor button
        let cmd = DispatchMouseEventParams::builder()
            .x(x as f64)
            .y(y as f64)
            .button(btn)
            .click_count(1);
        page.move_mouse(Point { x: x as f64, y: y as f64 })
            .await?
            .execute(cmd.clone().r#type(DispatchMouseEventType::MousePressed).build().unwrap())
            .await?;
        page.execute(cmd.r#type(DispatchMouseEventType::MouseReleased).build().unwrap())
            .await?;
        Ok(())
    }

    pub async fn scroll_by(&self, surface: &PageHandle, dx: i64, dy: i64) -> Result<()> {
        let page = self.page(surface).await?;
        let eval = EvaluateParams::builder()
            .expression(format!("window.scrollBy({dx}, {dy});"))
            .build()
            .map_err(|e| anyhow::anyhow!(e))?;
        page.execute(eval).await?;
        Ok(())
    }

    /// Raw key event pair through CDP, so default actions fire (Enter submits
    /// forms, Tab moves focus). Synthetic KeyboardEvents from JS do not.
    pub async fn press_key(&self, surface: &PageHandle, key: &str) -> Result<()> {
        let page = self.page(surface).await?;
        let down = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::KeyDown)
            .key(key.to_string())
            .build()
            .map_err(|e| anyhow::anyhow!(e))?;
        page.execute(down).await?;
        let up = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::KeyUp)
            .key(key.to_string())
            .build()
            .map_err(|e| anyhow::anyhow!(e))?;
        page.execute(up).await?;
        Ok(())
    }

    pub async fn type_text(&self, surface: &PageHandle, text: &str) -> Result<()> {
        let page = self.page(surface).await?;
        // CDP Input.insertText feeds the active element in one shot
        page.execute(InsertTextParams { text: text.to_string() }).await?;
        Ok(())
    }

    /// Viewport-sized PNG of the given tab. Never persisted here; the bytes
    /// go straight into the next model turn and are dropped.
    pub async fn screenshot(&self, surface: &PageHandle) -> Result<Vec<u8>> {
        let page = self.page(surface).await?;
        let take = || async {
            page.screenshot(
                ScreenshotParamsBuilder::default()
                    .format(CaptureScreenshotFormat::Png)
                    .build(),
            )
            .await
        };
        match take().await {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                let msg = format!("{}", e);
                if msg.contains("0 width") || msg.contains("0 height") {
                    // Force viewport and retry once
                    self.apply_viewport(&page).await;
                    sleep(Duration::from_millis(50)).await;
                    return Ok(take().await?);
                }
                Err(anyhow::anyhow!(e))
            }
        }
    }
}

fn handle_of(page: &Page) -> PageHandle {
    PageHandle::new(page.target_id().inner().clone())
}
