//! Resource locations
//!
//! A location selects the configuration scope a resource is written into.
//! On the wire it is a nested object keyed by the variant name, e.g.
//! `{"device_group": {"name": "dg1"}}`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The scope into which a resource is materialized on the device
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Location {
    /// Objects visible to every device group
    Shared {},
    /// A Panorama device group
    DeviceGroup { name: String },
    /// A template, optionally narrowed to one vsys
    Template {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        vsys: Option<String>,
    },
    /// A template stack
    TemplateStack { name: String },
    /// Panorama's own configuration
    Panorama {},
}

/// The variant of a [`Location`], without its parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationKind {
    Shared,
    DeviceGroup,
    Template,
    TemplateStack,
    Panorama,
}

impl LocationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::DeviceGroup => "device_group",
            Self::Template => "template",
            Self::TemplateStack => "template_stack",
            Self::Panorama => "panorama",
        }
    }
}

impl fmt::Display for LocationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Location {
    pub fn shared() -> Self {
        Self::Shared {}
    }

    pub fn panorama() -> Self {
        Self::Panorama {}
    }

    pub fn device_group(name: impl Into<String>) -> Self {
        Self::DeviceGroup { name: name.into() }
    }

    pub fn template(name: impl Into<String>, vsys: Option<&str>) -> Self {
        Self::Template {
            name: name.into(),
            vsys: vsys.map(str::to_string),
        }
    }

    pub fn template_stack(name: impl Into<String>) -> Self {
        Self::TemplateStack { name: name.into() }
    }

    pub fn kind(&self) -> LocationKind {
        match self {
            Self::Shared {} => LocationKind::Shared,
            Self::DeviceGroup { .. } => LocationKind::DeviceGroup,
            Self::Template { .. } => LocationKind::Template,
            Self::TemplateStack { .. } => LocationKind::TemplateStack,
            Self::Panorama {} => LocationKind::Panorama,
        }
    }

    /// Locations searched, in order, when resolving a reference made from here
    ///
    /// Device groups and templates see their own objects first and then the
    /// shared scope. Shared and Panorama only see themselves.
    pub fn lookup_chain(&self) -> Vec<Location> {
        match self {
            Self::DeviceGroup { .. } | Self::Template { .. } | Self::TemplateStack { .. } => {
                vec![self.clone(), Self::shared()]
            }
            Self::Shared {} | Self::Panorama {} => vec![self.clone()],
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared {} => write!(f, "shared"),
            Self::Panorama {} => write!(f, "panorama"),
            Self::DeviceGroup { name } => write!(f, "device_group:{name}"),
            Self::TemplateStack { name } => write!(f, "template_stack:{name}"),
            Self::Template { name, vsys: None } => write!(f, "template:{name}"),
            Self::Template {
                name,
                vsys: Some(vsys),
            } => write!(f, "template:{name}/{vsys}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_as_nested_object() {
        let json = serde_json::to_value(Location::device_group("dg1")).unwrap();
        assert_eq!(json, serde_json::json!({"device_group": {"name": "dg1"}}));

        let json = serde_json::to_value(Location::shared()).unwrap();
        assert_eq!(json, serde_json::json!({"shared": {}}));
    }

    #[test]
    fn test_template_vsys_roundtrip() {
        let loc = Location::template("t1", Some("vsys1"));
        let json = serde_json::to_string(&loc).unwrap();
        let back: Location = serde_json::from_str(&json).unwrap();
        assert_eq!(back, loc);
        assert_eq!(loc.to_string(), "template:t1/vsys1");
    }

    #[test]
    fn test_lookup_chain_falls_back_to_shared() {
        let chain = Location::device_group("dg1").lookup_chain();
        assert_eq!(chain, vec![Location::device_group("dg1"), Location::shared()]);
        assert_eq!(Location::shared().lookup_chain(), vec![Location::shared()]);
    }
}
