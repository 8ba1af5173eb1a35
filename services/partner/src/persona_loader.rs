use anyhow::{Context, Result};
use partner_core::persona::Persona;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Reads one persona from a JSON file.
pub fn load_persona(path: &Path) -> Result<Persona> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read persona file: {}", path.display()))?;
    Persona::from_json(&content)
        .with_context(|| format!("Invalid persona file: {}", path.display()))
}

/// Reads every `*.json` persona in a directory, keyed by file stem.
pub fn load_personas(dir_path: &Path) -> Result<HashMap<String, Persona>> {
    let mut personas = HashMap::new();

    for entry in fs::read_dir(dir_path)
        .with_context(|| format!("Failed to read persona directory: {}", dir_path.display()))?
    {
        let entry = entry?;
        let path = entry.path();

        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("json") {
            let key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("Could not get file stem for persona file")?
                .to_string();
            personas.insert(key, load_persona(&path)?);
        }
    }

    Ok(personas)
}

/// A loaded persona by name, or else a persona file at that path.
pub fn resolve_persona(arg: &str, personas: &HashMap<String, Persona>) -> Result<Persona> {
    match personas.get(arg) {
        Some(persona) => Ok(persona.clone()),
        None => load_persona(Path::new(arg)),
    }
}
