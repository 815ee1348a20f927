use crate::config::LabelsConfig;
use serde::Serialize;
use std::{
    collections::HashSet,
    fs::File,
    io::{self, BufRead},
    path::Path,
};
use thiserror::Error;

/// Masks store class ids as `u8`.
pub const MAX_CLASSES: usize = 256;

#[derive(Error, Debug)]
pub enum PaletteError {
    #[error("Failed to read labels file: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid line format at line {line_number}: {line}")]
    InvalidLine { line_number: usize, line: String },
    #[error("Invalid {channel} value at line {line_number}: {value}")]
    InvalidChannel {
        line_number: usize,
        channel: &'static str,
        value: String,
    },
    #[error("Duplicate class name: {0}")]
    DuplicateName(String),
    #[error("Palette must define between 1 and {MAX_CLASSES} classes, got {0}")]
    ClassCount(usize),
    #[error("Background class {index} is outside the palette of {num_classes} classes")]
    UnknownBackground { index: usize, num_classes: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassLabel {
    pub name: String,
    pub color: [u8; 3],
}

impl ClassLabel {
    pub fn new(name: &str, color: [u8; 3]) -> Self {
        Self {
            name: name.to_string(),
            color,
        }
    }
}

/// Read-only table from class index to display name and color, plus the set of
/// indices counted as background. Built once at startup and shared behind an `Arc`.
#[derive(Debug, Clone)]
pub struct ClassPalette {
    classes: Vec<ClassLabel>,
    background: Vec<bool>,
}

impl ClassPalette {
    pub fn new(classes: Vec<ClassLabel>, background_classes: &[usize]) -> Result<Self, PaletteError> {
        if classes.is_empty() || classes.len() > MAX_CLASSES {
            return Err(PaletteError::ClassCount(classes.len()));
        }

        let mut seen = HashSet::new();
        for class in &classes {
            if !seen.insert(class.name.as_str()) {
                return Err(PaletteError::DuplicateName(class.name.clone()));
            }
        }

        let mut background = vec![false; classes.len()];
        for &index in background_classes {
            match background.get_mut(index) {
                Some(flag) => *flag = true,
                None => {
                    return Err(PaletteError::UnknownBackground {
                        index,
                        num_classes: classes.len(),
                    })
                }
            }
        }

        Ok(Self {
            classes,
            background,
        })
    }

    pub fn from_config(labels_cfg: &LabelsConfig) -> Result<Self, PaletteError> {
        let classes = load_class_labels(&labels_cfg.get_path())?;
        Self::new(classes, &labels_cfg.background_classes)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn labels(&self) -> &[ClassLabel] {
        &self.classes
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.classes.get(index).map(|class| class.name.as_str())
    }

    /// Out-of-range ids render black.
    pub fn color(&self, index: usize) -> [u8; 3] {
        self.classes
            .get(index)
            .map(|class| class.color)
            .unwrap_or([0, 0, 0])
    }

    pub fn is_background(&self, index: usize) -> bool {
        self.background.get(index).copied().unwrap_or(false)
    }

    pub fn background_classes(&self) -> Vec<usize> {
        self.background
            .iter()
            .enumerate()
            .filter_map(|(index, &flag)| flag.then_some(index))
            .collect()
    }
}

pub fn load_class_labels(filepath: &Path) -> Result<Vec<ClassLabel>, PaletteError> {
    let file = File::open(filepath)?;
    parse_class_labels(io::BufReader::new(file))
}

/// Parses `name,red,green,blue` lines. Blank lines and `#` comments are skipped.
pub fn parse_class_labels(reader: impl BufRead) -> Result<Vec<ClassLabel>, PaletteError> {
    let mut class_labels = Vec::new();

    for (index, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        let line_number = index + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let parts: Vec<&str> = trimmed.split(',').map(str::trim).collect();
        if parts.len() != 4 || parts[0].is_empty() {
            return Err(PaletteError::InvalidLine { line_number, line });
        }

        let channel = |channel: &'static str, value: &str| {
            value.parse::<u8>().map_err(|_| PaletteError::InvalidChannel {
                line_number,
                channel,
                value: value.to_string(),
            })
        };

        class_labels.push(ClassLabel::new(
            parts[0],
            [
                channel("red", parts[1])?,
                channel("green", parts[2])?,
                channel("blue", parts[3])?,
            ],
        ));
    }

    Ok(class_labels)
}
