//! Display catalog trait
//!
//! This module provides the `DisplayCatalog` trait for enumerating the
//! displays a capture source can open.

use anyhow::Result;

/// A display as reported by the platform.
#[derive(Clone, Debug)]
pub struct DisplayDescriptor {
    pub id: u32,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub scale_factor: f64,
    pub is_primary: bool,
}

impl DisplayDescriptor {
    pub fn new(id: u32, width: u32, height: u32) -> Self {
        Self {
            id,
            name: format!("Display {} ({} x {})", id, width, height),
            width,
            height,
            scale_factor: 1.0,
            is_primary: id == 0,
        }
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl PartialEq for DisplayDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.width == other.width
            && self.height == other.height
            && self.scale_factor.to_bits() == other.scale_factor.to_bits()
            && self.is_primary == other.is_primary
    }
}

impl Eq for DisplayDescriptor {}

impl std::fmt::Display for DisplayDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Enumerates displays available for capture.
pub trait DisplayCatalog: Send + Sync {
    /// Returns a list of available displays.
    fn available_displays(&self) -> Result<Vec<DisplayDescriptor>>;

    /// Looks a display up by id. `Ok(None)` means the id is unknown.
    fn find_display(&self, id: u32) -> Result<Option<DisplayDescriptor>> {
        Ok(self.available_displays()?.into_iter().find(|d| d.id == id))
    }
}

/// Fixed display list.
#[derive(Clone, Debug, Default)]
pub struct StaticCatalog {
    displays: Vec<DisplayDescriptor>,
}

impl StaticCatalog {
    pub fn new(displays: Vec<DisplayDescriptor>) -> Self {
        Self { displays }
    }

    /// One 1920x1080 primary display with id 0.
    pub fn single_full_hd() -> Self {
        Self::new(vec![DisplayDescriptor::new(0, 1920, 1080)])
    }
}

impl DisplayCatalog for StaticCatalog {
    fn available_displays(&self) -> Result<Vec<DisplayDescriptor>> {
        Ok(self.displays.clone())
    }
}

/// Catalog backed by the operating system's display list.
#[cfg(feature = "os-displays")]
#[derive(Clone, Copy, Debug, Default)]
pub struct OsDisplayCatalog;

#[cfg(feature = "os-displays")]
impl DisplayCatalog for OsDisplayCatalog {
    fn available_displays(&self) -> Result<Vec<DisplayDescriptor>> {
        use display_info::DisplayInfo as OsDisplayInfo;

        let displays = OsDisplayInfo::all()
            .map_err(|e| anyhow::anyhow!("Failed to enumerate displays: {}", e))?;

        Ok(displays
            .into_iter()
            .map(|d| DisplayDescriptor {
                id: d.id,
                name: format!("{} ({} x {})", d.name, d.width, d.height),
                width: d.width,
                height: d.height,
                scale_factor: d.scale_factor as f64,
                is_primary: d.is_primary,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_display() {
        let catalog = StaticCatalog::new(vec![
            DisplayDescriptor::new(0, 1920, 1080),
            DisplayDescriptor::new(3, 800, 600),
        ]);

        let found = catalog.find_display(3).unwrap().expect("display 3");
        assert_eq!(found.resolution(), (800, 600));
        assert!(!found.is_primary);
        assert!(catalog.find_display(7).unwrap().is_none());
    }

    #[test]
    fn test_equality_includes_primary_flag() {
        let display = DisplayDescriptor::new(0, 1920, 1080);
        assert_eq!(display, display.clone());

        let secondary = DisplayDescriptor {
            is_primary: false,
            ..display.clone()
        };
        assert_ne!(display, secondary);
    }

    #[test]
    fn test_empty_catalog() {
        let catalog = StaticCatalog::default();
        assert!(catalog.available_displays().unwrap().is_empty());
        assert!(catalog.find_display(0).unwrap().is_none());
    }
}
