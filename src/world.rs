//! Static game data visible to scripts.

use serde::{Deserialize, Serialize};

use crate::config::WorldConfig;

/// A character vocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vocation {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// A town players can reside in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Town {
    pub id: i64,
    pub name: String,
}

/// Vocations and towns known to the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct World {
    pub vocations: Vec<Vocation>,
    pub towns: Vec<Town>,
}

impl World {
    pub fn new(vocations: Vec<Vocation>, towns: Vec<Town>) -> Self {
        Self { vocations, towns }
    }

    /// Look up a vocation by id.
    pub fn vocation(&self, id: i64) -> Option<&Vocation> {
        self.vocations.iter().find(|v| v.id == id)
    }

    /// Look up a town by id.
    pub fn town(&self, id: i64) -> Option<&Town> {
        self.towns.iter().find(|t| t.id == id)
    }
}

impl From<WorldConfig> for World {
    fn from(config: WorldConfig) -> Self {
        Self::new(config.vocations, config.towns)
    }
}
