//! Object templates: named recipes for building items and mobiles.
//!
//! A handful of templates are built in so a fresh world can create player
//! characters; more can be loaded from a YAML file and override those.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use super::object::{layer, Item, Mobile, Object, ObjectStore};
use super::types::Serial;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateKind {
    Item,
    Mobile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    pub kind: TemplateKind,
    #[serde(default)]
    pub display_name: String,
    /// Item graphic or mobile body
    pub graphic: u16,
    #[serde(default)]
    pub hue: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub layer: u8,
    #[serde(default)]
    pub gump: u16,
    #[serde(default = "default_hits")]
    pub hits: u16,
    #[serde(default = "default_stat")]
    pub strength: u16,
    #[serde(default = "default_stat")]
    pub dexterity: u16,
    #[serde(default = "default_stat")]
    pub intelligence: u16,
    /// Templates created alongside: worn by a mobile, or placed inside a container
    #[serde(default)]
    pub contents: Vec<String>,
}

fn default_weight() -> u32 {
    100
}

fn default_hits() -> u16 {
    50
}

fn default_stat() -> u16 {
    50
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Unknown template: {0}")]
    Unknown(String),

    #[error("Template {0} nests too deeply")]
    TooDeep(String),
}

#[derive(Debug, Deserialize)]
struct TemplateFile {
    templates: Vec<Template>,
}

pub struct TemplateManager {
    templates: HashMap<String, Template>,
}

impl TemplateManager {
    /// Built-in templates only.
    pub fn builtin() -> Self {
        let mut templates = HashMap::new();
        for t in builtin_templates() {
            templates.insert(t.name.clone(), t);
        }
        Self { templates }
    }

    /// Built-ins plus (and overridden by) the templates in `path`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read templates file: {}", path.display()))?;
        let mut manager = Self::builtin();
        manager.merge_str(&contents)
            .with_context(|| format!("Failed to parse templates in {}", path.display()))?;
        Ok(manager)
    }

    pub fn merge_str(&mut self, yaml: &str) -> Result<usize> {
        let file: TemplateFile = serde_yaml::from_str(yaml)?;
        let count = file.templates.len();
        for t in file.templates {
            self.templates.insert(t.name.clone(), t);
        }
        Ok(count)
    }

    pub fn get(&self, name: &str) -> Option<&Template> {
        self.templates.get(name)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Builds the named object and everything listed in its contents,
    /// inserts them into `store` and returns the root serial.
    pub fn create_by_name(&self, name: &str, store: &mut ObjectStore) -> Result<Serial, TemplateError> {
        self.create_nested(name, store, 0)
    }

    fn create_nested(
        &self,
        name: &str,
        store: &mut ObjectStore,
        depth: usize,
    ) -> Result<Serial, TemplateError> {
        if depth > 8 {
            return Err(TemplateError::TooDeep(name.to_string()));
        }
        let t = self
            .templates
            .get(name)
            .ok_or_else(|| TemplateError::Unknown(name.to_string()))?;
        let display = if t.display_name.is_empty() { &t.name } else { &t.display_name };

        let serial = match t.kind {
            TemplateKind::Item => {
                let serial = store.allocate_item_serial();
                let mut item = Item::new(serial, &t.name, display, t.graphic);
                item.hue = t.hue;
                item.weight = t.weight;
                item.layer = t.layer;
                item.gump = t.gump;
                store.insert(Object::Item(item));
                serial
            }
            TemplateKind::Mobile => {
                let serial = store.allocate_mobile_serial();
                let mut mobile = Mobile::new(serial, &t.name, display, t.graphic);
                mobile.hue = t.hue;
                mobile.hits = t.hits;
                mobile.max_hits = t.hits;
                mobile.strength = t.strength;
                mobile.dexterity = t.dexterity;
                mobile.intelligence = t.intelligence;
                store.insert(Object::Mobile(mobile));
                serial
            }
        };

        for child_name in &t.contents {
            let child = self.create_nested(child_name, store, depth + 1)?;
            let placed = if serial.is_mobile() {
                store.equip(child, serial)
            } else {
                store.add_to_container(child, serial, Default::default())
            };
            if let Err(e) = placed {
                tracing::warn!(
                    "[templates] [create] template={} child={} error={}",
                    name,
                    child_name,
                    e
                );
                store.take_tree(child);
            }
        }

        Ok(serial)
    }
}

fn item(name: &str, display: &str, graphic: u16, layer: u8, gump: u16, weight: u32) -> Template {
    Template {
        name: name.to_string(),
        kind: TemplateKind::Item,
        display_name: display.to_string(),
        graphic,
        hue: 0,
        weight,
        layer,
        gump,
        hits: default_hits(),
        strength: default_stat(),
        dexterity: default_stat(),
        intelligence: default_stat(),
        contents: Vec::new(),
    }
}

fn builtin_templates() -> Vec<Template> {
    let player = Template {
        name: "Player".to_string(),
        kind: TemplateKind::Mobile,
        display_name: "a player".to_string(),
        graphic: 0x0190,
        hue: 0x83EA,
        weight: 0,
        layer: 0,
        gump: 0,
        hits: 50,
        strength: 50,
        dexterity: 50,
        intelligence: 50,
        contents: vec!["Backpack".to_string(), "Shirt".to_string(), "Pants".to_string(), "Shoes".to_string()],
    };
    let mut gm = player.clone();
    gm.name = "GameMaster".to_string();
    gm.display_name = "a game master".to_string();
    gm.hits = 100;
    gm.strength = 100;
    gm.dexterity = 100;
    gm.intelligence = 100;
    gm.contents = vec!["Backpack".to_string(), "GameMasterRobe".to_string()];

    let mut backpack = item("Backpack", "backpack", 0x0E75, layer::BACKPACK, 0x3C, 300);
    backpack.contents = vec!["Gold".to_string()];
    let mut robe = item("GameMasterRobe", "game master robe", 0x204F, layer::OUTER_TORSO, 0, 200);
    robe.hue = 0x0026;

    vec![
        player,
        gm,
        backpack,
        robe,
        item("Bag", "bag", 0x0E76, 0, 0x3D, 200),
        item("Gold", "gold coin", 0x0EED, 0, 0, 2),
        item("Shirt", "shirt", 0x1517, layer::SHIRT, 0, 100),
        item("Pants", "long pants", 0x1539, layer::PANTS, 0, 200),
        item("Shoes", "shoes", 0x170F, layer::SHOES, 0, 200),
        item("Dagger", "dagger", 0x0F52, layer::ONE_HANDED, 0, 100),
    ]
}
