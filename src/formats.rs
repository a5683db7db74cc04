use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeyMessage {
    pub key_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub slides: Vec<Slide>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub shared_assets_ignore: bool,
    /// Project-specific fields, passed through to `app.json` untouched.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl KeyMessage {
    pub fn new(key_message: impl Into<String>) -> Self {
        Self {
            key_message: key_message.into(),
            description: None,
            slides: Vec::new(),
            shared_assets_ignore: false,
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Slide {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub screenshots: Vec<ScreenshotEvent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overlays: Vec<PopupRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enlargements: Vec<PopupRef>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A slide state worth its own proof page: either a bare event name or a
/// single-key mapping `event: element_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawScreenshotEvent", into = "RawScreenshotEvent")]
pub enum ScreenshotEvent {
    Event(String),
    EventOnElement { event: String, element_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawScreenshotEvent {
    Event(String),
    Mapping(BTreeMap<String, String>),
}

impl TryFrom<RawScreenshotEvent> for ScreenshotEvent {
    type Error = String;

    fn try_from(raw: RawScreenshotEvent) -> Result<Self, Self::Error> {
        match raw {
            RawScreenshotEvent::Event(event) => Ok(Self::Event(event)),
            RawScreenshotEvent::Mapping(map) => {
                if map.len() != 1 {
                    return Err(format!(
                        "screenshot event mapping must have exactly one key, got {}",
                        map.len()
                    ));
                }
                let (event, element_id) = map
                    .into_iter()
                    .next()
                    .ok_or_else(|| "screenshot event mapping is empty".to_owned())?;
                Ok(Self::EventOnElement { event, element_id })
            }
        }
    }
}

impl From<ScreenshotEvent> for RawScreenshotEvent {
    fn from(event: ScreenshotEvent) -> Self {
        match event {
            ScreenshotEvent::Event(event) => Self::Event(event),
            ScreenshotEvent::EventOnElement { event, element_id } => {
                Self::Mapping(BTreeMap::from([(event, element_id)]))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PopupRef {
    pub file: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Product {
    #[serde(default, deserialize_with = "de_opt_scalar")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "de_opt_scalar")]
    pub suffix: Option<String>,
}

impl Product {
    /// `name + suffix`, or `None` when no product name is configured.
    pub fn prefix(&self) -> Option<String> {
        let name = self.name.as_deref().filter(|n| !n.is_empty())?;
        Some(format!("{name}{}", self.suffix.as_deref().unwrap_or_default()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployTarget {
    #[default]
    Ftp,
    Vault,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Crm {
    #[serde(default)]
    pub deploy_to: DeployTarget,
    #[serde(default, rename = "hasSharedResources")]
    pub has_shared_resources: bool,
    #[serde(default, rename = "hasFlyoutMenu")]
    pub has_flyout_menu: bool,
    #[serde(default, deserialize_with = "de_scalar")]
    pub presentation_id: String,
    #[serde(default, deserialize_with = "de_scalar")]
    pub presentation_name: String,
    #[serde(default, deserialize_with = "de_scalar")]
    pub presentation_country: String,
    #[serde(default)]
    pub presentation_training: Option<FlagValue>,
    #[serde(default, deserialize_with = "de_opt_scalar")]
    pub slide_related_shared_resource: Option<String>,
}

impl Crm {
    pub fn shared_resource(&self) -> Option<&str> {
        self.slide_related_shared_resource
            .as_deref()
            .filter(|id| !id.is_empty())
    }
}

/// Boolean-ish CRM field that projects sometimes write as text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagValue {
    Bool(bool),
    Text(String),
}

impl FlagValue {
    pub fn to_field(&self) -> String {
        match self {
            Self::Bool(true) => "TRUE".to_owned(),
            Self::Bool(false) => "FALSE".to_owned(),
            Self::Text(text) => text.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThumbnailSize {
    pub width: u32,
    pub height: u32,
    pub name: String,
    pub quality: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThumbnailSizes {
    #[serde(default = "default_full_size")]
    pub full: ThumbnailSize,
    #[serde(default = "default_thumb_size")]
    pub thumb: ThumbnailSize,
}

impl Default for ThumbnailSizes {
    fn default() -> Self {
        Self {
            full: default_full_size(),
            thumb: default_thumb_size(),
        }
    }
}

fn default_full_size() -> ThumbnailSize {
    ThumbnailSize {
        width: 1024,
        height: 768,
        name: "full.jpg".to_owned(),
        quality: 75,
    }
}

fn default_thumb_size() -> ThumbnailSize {
    ThumbnailSize {
        width: 1024,
        height: 768,
        name: "thumb.jpg".to_owned(),
        quality: 55,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageLayout {
    #[default]
    Portrait,
    Landscape,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Margins {
    pub top: u32,
    pub left: u32,
    pub right: u32,
    pub bottom: u32,
}

impl Default for Margins {
    fn default() -> Self {
        Self {
            top: 72,
            left: 60,
            right: 72,
            bottom: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdfDocument {
    #[serde(default)]
    pub layout: PageLayout,
    #[serde(default)]
    pub margins: Margins,
    #[serde(default = "default_pdf_size")]
    pub size: [u32; 2],
}

impl Default for PdfDocument {
    fn default() -> Self {
        Self {
            layout: PageLayout::default(),
            margins: Margins::default(),
            size: default_pdf_size(),
        }
    }
}

impl PdfDocument {
    /// Page `(width, height)` after applying the layout orientation.
    pub fn page_size(&self) -> (u32, u32) {
        let [first, second] = self.size;
        match self.layout {
            PageLayout::Portrait => (first, second),
            PageLayout::Landscape => (second, first),
        }
    }

    pub fn image_box(&self) -> (u32, u32) {
        let (width, height) = self.page_size();
        (
            width.saturating_sub(self.margins.left + self.margins.right),
            height.saturating_sub(self.margins.top + self.margins.bottom),
        )
    }
}

fn default_pdf_size() -> [u32; 2] {
    [2048, 1536]
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Job {
    #[serde(default, deserialize_with = "de_opt_scalar")]
    pub number: Option<String>,
    #[serde(default, deserialize_with = "de_opt_scalar")]
    pub name: Option<String>,
}

impl Job {
    pub fn pdf_file_stem(&self) -> String {
        match (self.number.as_deref(), self.name.as_deref()) {
            (Some(number), Some(name)) if !number.is_empty() && !name.is_empty() => {
                format!("{number}_{name}")
            }
            _ => "screenshots".to_owned(),
        }
    }
}

/// Browser emulation profile, same shape as puppeteer's device descriptors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "userAgent")]
    pub user_agent: String,
    pub viewport: Viewport,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_scale_factor", rename = "deviceScaleFactor")]
    pub device_scale_factor: f64,
    #[serde(default, rename = "isMobile")]
    pub is_mobile: bool,
    #[serde(default, rename = "hasTouch")]
    pub has_touch: bool,
    #[serde(default, rename = "isLandscape")]
    pub is_landscape: bool,
}

fn default_scale_factor() -> f64 {
    1.0
}

impl DeviceProfile {
    pub fn ipad_landscape() -> Self {
        Self {
            name: Some("iPad landscape".to_owned()),
            user_agent: "Mozilla/5.0 (iPad; CPU OS 11_0 like Mac OS X) AppleWebKit/604.1.34 (KHTML, like Gecko) Version/11.0 Mobile/15A5341f Safari/604.1".to_owned(),
            viewport: Viewport {
                width: 1024,
                height: 768,
                device_scale_factor: 2.0,
                is_mobile: true,
                has_touch: true,
                is_landscape: true,
            },
        }
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct FtpSettings {
    #[serde(default, deserialize_with = "de_opt_scalar")]
    pub host: Option<String>,
    #[serde(default, deserialize_with = "de_opt_scalar")]
    pub user: Option<String>,
    #[serde(default, deserialize_with = "de_opt_scalar")]
    pub pass: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub secure: bool,
    #[serde(default, deserialize_with = "de_opt_scalar")]
    pub email: Option<String>,
}

impl FtpSettings {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(21)
    }
}

impl std::fmt::Debug for FtpSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpSettings")
            .field("host", &self.host)
            .field("user", &self.user)
            .field("pass", &self.pass.as_ref().map(|_| "<redacted>"))
            .field("port", &self.port)
            .field("secure", &self.secure)
            .field("email", &self.email)
            .finish()
    }
}

/// YAML happily turns `number: 0042` or `id: 12` into integers.
fn de_scalar<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(de_opt_scalar(deserializer)?.unwrap_or_default())
}

fn de_opt_scalar<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_yaml::Value::Null) => Ok(None),
        Some(serde_yaml::Value::String(s)) => Ok(Some(s)),
        Some(serde_yaml::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(serde_yaml::Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected a scalar value, got {other:?}"
        ))),
    }
}
