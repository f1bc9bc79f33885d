use std::path::Path;

use camino::Utf8Path;
use dicom::core::value::{PrimitiveValue, Value};
use dicom::core::{Tag, VR};
use dicom::dictionary_std::tags;
use dicom::object::{DefaultDicomObject, open_file};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, warn};

use crate::error::RelayError;
use crate::retrieval::StagingArtifact;
use crate::store::{METADATA_FILE, Store};

pub const UNKNOWN_PATIENT: &str = "UNKNOWN";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyMetadata {
    pub accession_number: String,
    pub patient_name: String,
    pub modality: String,
    pub study_description: String,
    pub patient_age: Option<String>,
    pub normalized_age: Option<String>,
    pub study_instance_uid: String,
    pub series_count: usize,
    pub instance_count: usize,
    pub exam_order_id: Option<String>,
    pub server: String,
    /// Tags that were absent from the representative instance.
    #[serde(default)]
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MetadataExtractor {
    dump_series_tags: bool,
}

impl MetadataExtractor {
    pub fn new(dump_series_tags: bool) -> Self {
        Self { dump_series_tags }
    }

    pub fn dumps_series_tags(&self) -> bool {
        self.dump_series_tags
    }

    /// Reads routing tags from the first instance. Missing or unreadable tags fall back to
    /// defaults; the study is never failed here.
    pub fn extract(&self, artifact: &StagingArtifact) -> StudyMetadata {
        let reference = &artifact.reference;
        let object = match artifact.instances.first() {
            Some(instance) => match open_file(&instance.path) {
                Ok(object) => Some(object),
                Err(err) => {
                    let missing = RelayError::MetadataMissing(format!(
                        "{}: {err}",
                        instance.path.display()
                    ));
                    warn!(accession = %reference.accession, error = %missing, "using default metadata");
                    None
                }
            },
            None => None,
        };

        let mut missing = Vec::new();
        let mut read = |tag: Tag, name: &str| {
            let value = object.as_ref().and_then(|object| string_element(object, tag));
            if value.is_none() {
                missing.push(name.to_string());
            }
            value
        };

        let accession_number = read(tags::ACCESSION_NUMBER, "AccessionNumber")
            .unwrap_or_else(|| reference.accession.query_key().to_string());
        let patient_name = read(tags::PATIENT_NAME, "PatientName")
            .unwrap_or_else(|| UNKNOWN_PATIENT.to_string());
        let modality = read(tags::MODALITY, "Modality").unwrap_or_default();
        let study_description = read(tags::STUDY_DESCRIPTION, "StudyDescription")
            .or_else(|| reference.exam_description.clone())
            .unwrap_or_default();
        let patient_age = read(tags::PATIENT_AGE, "PatientAge");
        let study_instance_uid = read(tags::STUDY_INSTANCE_UID, "StudyInstanceUID")
            .unwrap_or_else(|| artifact.study_uid.clone());

        if !missing.is_empty() {
            debug!(accession = %reference.accession, missing = ?missing, "tags defaulted");
        }

        StudyMetadata {
            accession_number,
            patient_name,
            modality,
            study_description,
            normalized_age: patient_age.as_deref().map(normalize_age),
            patient_age,
            study_instance_uid,
            series_count: artifact.layout.series.len(),
            instance_count: artifact.instances.len(),
            exam_order_id: reference.exam_order_id.clone(),
            server: artifact.primary_server.to_string(),
            missing,
        }
    }

    pub fn write_document(dir: &Utf8Path, metadata: &StudyMetadata) -> Result<(), RelayError> {
        Store::write_json(&dir.join(METADATA_FILE), metadata)
    }

    /// Writes `metadata_series_<n>.json` for the first instance of every series.
    pub fn dump_series(&self, artifact: &StagingArtifact, dir: &Utf8Path) -> Result<usize, RelayError> {
        if !self.dump_series_tags {
            return Ok(0);
        }
        let mut written = 0;
        for instance in artifact
            .instances
            .iter()
            .filter(|instance| instance.instance_index == 0)
        {
            let dump = match dump_tags(&instance.path) {
                Ok(dump) => dump,
                Err(err) => {
                    warn!(path = %instance.path.display(), error = %err, "series tag dump skipped");
                    continue;
                }
            };
            let path = dir.join(format!("metadata_series_{}.json", instance.series_index + 1));
            Store::write_json(&path, &dump)?;
            written += 1;
        }
        Ok(written)
    }
}

/// `093Y` becomes `93-years-old`; any other unit or shape is returned untouched.
pub fn normalize_age(raw: &str) -> String {
    let trimmed = raw.trim();
    let bytes = trimmed.as_bytes();
    if bytes.len() == 4 && bytes[..3].iter().all(u8::is_ascii_digit) && bytes[3] == b'Y' {
        if let Ok(years) = trimmed[..3].parse::<u32>() {
            return format!("{years}-years-old");
        }
    }
    trimmed.to_string()
}

/// Header ordering of one instance: SeriesNumber, SeriesInstanceUID, InstanceNumber, then
/// file name. Missing or non-numeric numbers sort as 0.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct InstanceOrder {
    pub series_number: u32,
    pub series_uid: String,
    pub instance_number: u32,
    pub file_name: String,
}

impl InstanceOrder {
    pub fn read(path: &Path) -> Self {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let number = |object: &DefaultDicomObject, tag: Tag| {
            string_element(object, tag)
                .and_then(|value| value.parse::<u32>().ok())
                .unwrap_or(0)
        };
        match open_file(path) {
            Ok(object) => Self {
                series_number: number(&object, tags::SERIES_NUMBER),
                series_uid: string_element(&object, tags::SERIES_INSTANCE_UID).unwrap_or_default(),
                instance_number: number(&object, tags::INSTANCE_NUMBER),
                file_name,
            },
            Err(err) => {
                debug!(path = %path.display(), error = %err, "instance header unreadable; ordering by name");
                Self {
                    series_number: 0,
                    series_uid: String::new(),
                    instance_number: 0,
                    file_name,
                }
            }
        }
    }
}

fn string_element(object: &DefaultDicomObject, tag: Tag) -> Option<String> {
    let element = object.element(tag).ok()?;
    let value = match element.value() {
        Value::Primitive(PrimitiveValue::Str(s)) => s.to_string(),
        Value::Primitive(PrimitiveValue::Strs(strings)) => strings.first()?.to_string(),
        Value::Primitive(primitive) => primitive.to_str().to_string(),
        _ => return None,
    };
    let value = value.trim_end_matches('\0').trim().to_string();
    if value.is_empty() { None } else { Some(value) }
}

fn dump_tags(path: &Path) -> Result<JsonValue, RelayError> {
    let object = open_file(path).map_err(|err| RelayError::InvalidInstance {
        path: path.display().to_string(),
        reason: err.to_string(),
    })?;
    let mut map = Map::new();
    for element in object.iter() {
        let header = element.header();
        let vr = header.vr;
        if matches!(
            vr,
            VR::OB | VR::OW | VR::OF | VR::OD | VR::OL | VR::UN | VR::SQ
        ) {
            continue;
        }
        let Value::Primitive(primitive) = element.value() else {
            continue;
        };
        let text = primitive.to_str().trim_end_matches('\0').trim().to_string();
        map.insert(
            header.tag.to_string(),
            serde_json::json!({ "vr": format!("{vr:?}"), "value": text }),
        );
    }
    Ok(JsonValue::Object(map))
}
