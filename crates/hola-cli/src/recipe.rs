//! JSON recipe manifest loading.
//!
//! The manifest is an ordered array of resource declarations (or an
//! object with a `resources` array): each entry names its `kind`, its
//! identifier (`name`), and the per-kind properties from the recipe
//! surface. Every entry funnels through the same builder and
//! registration call an embedded interpreter would use, so the full
//! pipeline is exercised.
//!
//! Manifest recipes carry string guards only; `ruby_block` needs a
//! scripting runtime and is rejected at load.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde_json::Value;

use hola::builder::{
    AwsKmsBuilder, DirectoryBuilder, ExecuteBuilder, FileBuilder, GitBuilder, LinkBuilder,
    PackageBuilder, RemoteFileBuilder, SystemdUnitBuilder, TemplateBuilder,
};
use hola::host::RecipeHost;
use hola::types::ResourceList;

/// Load a manifest file into a registered resource list.
pub fn load_recipe(path: &Path) -> Result<ResourceList> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read recipe {}", path.display()))?;
    let value: Value = serde_json::from_str(&text)
        .with_context(|| format!("recipe {} is not valid JSON", path.display()))?;

    let entries = match &value {
        Value::Array(entries) => entries.as_slice(),
        Value::Object(map) => map
            .get("resources")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .context("recipe object must have a 'resources' array")?,
        _ => bail!("recipe must be an array of resource declarations"),
    };

    let mut host = RecipeHost::new();
    for (position, entry) in entries.iter().enumerate() {
        register_entry(&mut host, entry)
            .with_context(|| format!("recipe entry #{position}"))?;
    }
    Ok(host.into_resources())
}

fn register_entry(host: &mut RecipeHost, entry: &Value) -> Result<()> {
    let obj = entry
        .as_object()
        .context("resource declaration must be an object")?;
    let kind = obj
        .get("kind")
        .and_then(Value::as_str)
        .context("resource declaration missing 'kind'")?;
    let name = obj
        .get("name")
        .and_then(Value::as_str)
        .context("resource declaration missing 'name'")?;

    macro_rules! build {
        ($builder:expr) => {{
            let mut builder = $builder;
            for (key, value) in obj {
                if key == "kind" || key == "name" {
                    continue;
                }
                builder.set(key, value)?;
            }
            builder.register(host)
        }};
    }

    match kind {
        "file" => build!(FileBuilder::new(name)),
        "directory" => build!(DirectoryBuilder::new(name)),
        "link" => build!(LinkBuilder::new(name)),
        "remote_file" => build!(RemoteFileBuilder::new(name)),
        "execute" => build!(ExecuteBuilder::new(name)),
        "template" => build!(TemplateBuilder::new(name)),
        "git" => build!(GitBuilder::new(name)),
        "package" | "apt_package" | "homebrew_package" => {
            let mut builder = PackageBuilder::new(name);
            if kind == "apt_package" {
                builder.set("provider", &Value::String("apt".to_string()))?;
            } else if kind == "homebrew_package" {
                builder.set("provider", &Value::String("homebrew".to_string()))?;
            }
            for (key, value) in obj {
                if key == "kind" || key == "name" {
                    continue;
                }
                builder.set(key, value)?;
            }
            builder.register(host)
        }
        "systemd_unit" => build!(SystemdUnitBuilder::new(name)),
        "aws_kms" => build!(AwsKmsBuilder::new(name)),
        "ruby_block" => {
            bail!("ruby_block resources need an embedded interpreter and cannot be loaded from a manifest")
        }
        other => bail!("unknown resource kind {other:?}"),
    }
}
