use std::io::Write;
use std::path::Path;

use anyhow::Context;

use crate::models::StudentFeatures;

pub fn write_csv<W: Write>(writer: W, features: &[StudentFeatures]) -> anyhow::Result<()> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    for record in features {
        csv_writer.serialize(record)?;
    }
    csv_writer.flush()?;
    Ok(())
}

pub fn export_csv(path: &Path, features: &[StudentFeatures]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let file = std::fs::File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    write_csv(file, features).with_context(|| format!("failed to write {}", path.display()))
}
