//! Specialists and teams from the agents directory.
//!
//! ```text
//! agents/
//!   specialists/
//!     writer.md        # optional YAML frontmatter, body is the role text
//!     editor.yaml      # `system_prompt:` holds the role text
//!   teams/
//!     team-writers.yaml  # `collaboration_tone:` (or legacy `tone:`)
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// A specialist role definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecialistDef {
    /// File stem, e.g. `writer`.
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    /// Role text prepended to every prompt of blocks using this specialist.
    #[serde(default)]
    pub system_prompt: String,
}

impl SpecialistDef {
    /// Parse a specialist definition from a YAML string.
    pub fn from_yaml(id: &str, yaml: &str) -> Result<Self, String> {
        let mut def: SpecialistDef = serde_yaml::from_str(yaml)
            .map_err(|e| format!("Failed to parse specialist YAML: {}", e))?;
        def.id = id.to_string();
        Ok(def)
    }

    /// Parse a Markdown specialist. YAML frontmatter between `---` lines is
    /// optional and stripped from the role text.
    pub fn from_markdown(id: &str, content: &str) -> Result<Self, String> {
        #[derive(Deserialize, Default)]
        struct FrontMatter {
            name: Option<String>,
            description: Option<String>,
        }

        let (front, body) = split_frontmatter(content);
        let fm: FrontMatter = match front {
            Some(yaml) => serde_yaml::from_str(yaml)
                .map_err(|e| format!("Failed to parse frontmatter of '{}': {}", id, e))?,
            None => FrontMatter::default(),
        };

        Ok(Self {
            id: id.to_string(),
            name: fm.name,
            description: fm.description,
            system_prompt: body.trim().to_string(),
        })
    }

    /// Load from a `.md`, `.yaml` or `.yml` file.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let id = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read specialist file '{}': {}", path.display(), e))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("md") => Self::from_markdown(&id, &content),
            _ => Self::from_yaml(&id, &content),
        }
    }
}

fn split_frontmatter(content: &str) -> (Option<&str>, &str) {
    let trimmed = content.trim_start();
    let Some(rest) = trimmed.strip_prefix("---") else {
        return (None, content);
    };
    match rest.find("\n---") {
        Some(end) => {
            let front = &rest[..end];
            let body = &rest[end + 4..];
            (Some(front), body)
        }
        None => (None, content),
    }
}

#[derive(Debug, Deserialize)]
struct TeamFile {
    #[serde(default)]
    collaboration_tone: Option<String>,
    #[serde(default)]
    tone: Option<String>,
}

/// Read-only view over an agents directory.
#[derive(Debug, Clone)]
pub struct AgentLibrary {
    agents_dir: PathBuf,
}

impl AgentLibrary {
    pub fn new(agents_dir: impl Into<PathBuf>) -> Self {
        Self {
            agents_dir: agents_dir.into(),
        }
    }

    pub fn agents_dir(&self) -> &Path {
        &self.agents_dir
    }

    fn specialists_dir(&self) -> PathBuf {
        self.agents_dir.join("specialists")
    }

    /// Collaboration tone of a team, or empty text when it cannot be loaded.
    pub fn team_tone(&self, team: &str) -> String {
        let path = self.agents_dir.join("teams").join(format!("{}.yaml", team));
        let parsed = std::fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|s| serde_yaml::from_str::<TeamFile>(&s).map_err(|e| e.to_string()));
        match parsed {
            Ok(file) => file.collaboration_tone.or(file.tone).unwrap_or_default(),
            Err(e) => {
                tracing::warn!("[AgentLibrary] Team '{}' not loaded: {}", team, e);
                String::new()
            }
        }
    }

    /// Find a specialist by id (`.md` first, then `.yaml`/`.yml`).
    pub fn specialist(&self, id: &str) -> Option<SpecialistDef> {
        let dir = self.specialists_dir();
        ["md", "yaml", "yml"]
            .iter()
            .map(|ext| dir.join(format!("{}.{}", id, ext)))
            .find(|p| p.is_file())
            .and_then(|p| match SpecialistDef::from_file(&p) {
                Ok(def) => Some(def),
                Err(e) => {
                    tracing::warn!("[AgentLibrary] {}", e);
                    None
                }
            })
    }

    /// Role text of a specialist, or empty text when it cannot be loaded.
    pub fn specialist_text(&self, id: &str) -> String {
        match self.specialist(id) {
            Some(def) => def.system_prompt,
            None => {
                tracing::warn!("[AgentLibrary] Specialist '{}' not found", id);
                String::new()
            }
        }
    }

    /// All specialists, sorted by id.
    pub fn list_specialists(&self) -> Result<Vec<SpecialistDef>, String> {
        let dir = self.specialists_dir();
        if !dir.is_dir() {
            return Err(format!("Specialist directory '{}' does not exist", dir.display()));
        }

        let mut specialists = Vec::new();
        for entry in std::fs::read_dir(&dir)
            .map_err(|e| format!("Failed to read directory '{}': {}", dir.display(), e))?
        {
            let entry = entry.map_err(|e| format!("Directory entry error: {}", e))?;
            let path = entry.path();
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if !matches!(ext, "md" | "yaml" | "yml") {
                continue;
            }
            match SpecialistDef::from_file(&path) {
                Ok(def) => specialists.push(def),
                Err(e) => tracing::warn!("[AgentLibrary] Skipping {}: {}", path.display(), e),
            }
        }
        specialists.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(specialists)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn library() -> (TempDir, AgentLibrary) {
        let dir = TempDir::new().unwrap();
        let specialists = dir.path().join("specialists");
        let teams = dir.path().join("teams");
        std::fs::create_dir_all(&specialists).unwrap();
        std::fs::create_dir_all(&teams).unwrap();
        std::fs::write(
            specialists.join("writer.md"),
            "---\nname: Writer\ndescription: Writes drafts\n---\n\nYou write vivid prose.\n",
        )
        .unwrap();
        std::fs::write(
            specialists.join("editor.yaml"),
            "name: Editor\nsystem_prompt: |\n  You edit ruthlessly.\n",
        )
        .unwrap();
        std::fs::write(specialists.join("notes.txt"), "ignored").unwrap();
        std::fs::write(teams.join("team-writers.yaml"), "collaboration_tone: Be kind.\n").unwrap();
        std::fs::write(teams.join("team-old.yaml"), "tone: Be terse.\n").unwrap();
        let lib = AgentLibrary::new(dir.path());
        (dir, lib)
    }

    #[test]
    fn test_markdown_frontmatter_stripped() {
        let (_dir, lib) = library();
        assert_eq!(lib.specialist_text("writer"), "You write vivid prose.");
        let def = lib.specialist("writer").unwrap();
        assert_eq!(def.name.as_deref(), Some("Writer"));
    }

    #[test]
    fn test_yaml_specialist_and_missing() {
        let (_dir, lib) = library();
        assert_eq!(lib.specialist_text("editor").trim(), "You edit ruthlessly.");
        assert_eq!(lib.specialist_text("ghost"), "");
    }

    #[test]
    fn test_team_tone_fields() {
        let (_dir, lib) = library();
        assert_eq!(lib.team_tone("team-writers"), "Be kind.");
        assert_eq!(lib.team_tone("team-old"), "Be terse.");
        assert_eq!(lib.team_tone("team-missing"), "");
    }

    #[test]
    fn test_list_specialists_sorted() {
        let (_dir, lib) = library();
        let ids: Vec<String> = lib.list_specialists().unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["editor", "writer"]);
    }

    #[test]
    fn test_markdown_without_frontmatter() {
        let def = SpecialistDef::from_markdown("plain", "Just text.\n").unwrap();
        assert_eq!(def.system_prompt, "Just text.");
        assert!(def.name.is_none());
    }
}
