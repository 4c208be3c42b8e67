//! XMP packet synthesis from the nine metadata fields.
//!
//! Every field is either a single value shared by the whole batch or a
//! list holding one value per batch position (see [`MetadataValue`]).
//! [`build_xmp`] resolves each field for one batch index and serializes
//! the present ones into a standalone XMP packet.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::SaveError;

/// The fixed set of metadata fields embedded into saved images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataField {
    Creator,
    Rights,
    Title,
    Description,
    Subject,
    Instructions,
    Comment,
    AltText,
    ExtDescription,
}

impl MetadataField {
    pub const ALL: [MetadataField; 9] = [
        MetadataField::Creator,
        MetadataField::Rights,
        MetadataField::Title,
        MetadataField::Description,
        MetadataField::Subject,
        MetadataField::Instructions,
        MetadataField::Comment,
        MetadataField::AltText,
        MetadataField::ExtDescription,
    ];

    /// The input name of this field (`creator`, `alt_text`, ...).
    pub fn name(&self) -> &'static str {
        match self {
            Self::Creator => "creator",
            Self::Rights => "rights",
            Self::Title => "title",
            Self::Description => "description",
            Self::Subject => "subject",
            Self::Instructions => "instructions",
            Self::Comment => "comment",
            Self::AltText => "alt_text",
            Self::ExtDescription => "ext_description",
        }
    }
}

impl fmt::Display for MetadataField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A field value: one string for every image, or one string per batch item.
///
/// Deserializes from either a JSON string or a JSON array of strings.
///
/// # Example
///
/// ```rust
/// use xmp_save::xmp::{MetadataField, MetadataValue, resolve};
///
/// let shared = MetadataValue::from("Jane Doe");
/// assert_eq!(resolve(&shared, MetadataField::Creator, 3).unwrap(), Some("Jane Doe"));
///
/// let per_item = MetadataValue::from(vec!["first", "second"]);
/// assert_eq!(resolve(&per_item, MetadataField::Title, 1).unwrap(), Some("second"));
/// assert!(resolve(&per_item, MetadataField::Title, 2).is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Scalar(String),
    PerBatch(Vec<String>),
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::Scalar(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::Scalar(value)
    }
}

impl<S: Into<String>> From<Vec<S>> for MetadataValue {
    fn from(values: Vec<S>) -> Self {
        Self::PerBatch(values.into_iter().map(Into::into).collect())
    }
}

/// The nine optional metadata fields of one save request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct XmpFields {
    pub creator: Option<MetadataValue>,
    pub rights: Option<MetadataValue>,
    pub title: Option<MetadataValue>,
    pub description: Option<MetadataValue>,
    pub subject: Option<MetadataValue>,
    pub instructions: Option<MetadataValue>,
    pub comment: Option<MetadataValue>,
    pub alt_text: Option<MetadataValue>,
    pub ext_description: Option<MetadataValue>,
}

impl XmpFields {
    pub fn get(&self, field: MetadataField) -> Option<&MetadataValue> {
        match field {
            MetadataField::Creator => self.creator.as_ref(),
            MetadataField::Rights => self.rights.as_ref(),
            MetadataField::Title => self.title.as_ref(),
            MetadataField::Description => self.description.as_ref(),
            MetadataField::Subject => self.subject.as_ref(),
            MetadataField::Instructions => self.instructions.as_ref(),
            MetadataField::Comment => self.comment.as_ref(),
            MetadataField::AltText => self.alt_text.as_ref(),
            MetadataField::ExtDescription => self.ext_description.as_ref(),
        }
    }

    pub fn set(&mut self, field: MetadataField, value: Option<MetadataValue>) {
        let slot = match field {
            MetadataField::Creator => &mut self.creator,
            MetadataField::Rights => &mut self.rights,
            MetadataField::Title => &mut self.title,
            MetadataField::Description => &mut self.description,
            MetadataField::Subject => &mut self.subject,
            MetadataField::Instructions => &mut self.instructions,
            MetadataField::Comment => &mut self.comment,
            MetadataField::AltText => &mut self.alt_text,
            MetadataField::ExtDescription => &mut self.ext_description,
        };
        *slot = value;
    }

    /// Fill every absent field from `defaults`.
    pub fn with_defaults(mut self, defaults: &XmpFields) -> Self {
        for field in MetadataField::ALL {
            if self.get(field).is_none() {
                self.set(field, defaults.get(field).cloned());
            }
        }
        self
    }
}

/// Resolve a field value for one batch position.
///
/// An empty string counts as absent. A list shorter than the batch is a
/// caller error, never clamped or wrapped.
pub fn resolve(
    value: &MetadataValue,
    field: MetadataField,
    batch_index: usize,
) -> Result<Option<&str>, SaveError> {
    let text = match value {
        MetadataValue::Scalar(text) => text.as_str(),
        MetadataValue::PerBatch(values) => values
            .get(batch_index)
            .ok_or(SaveError::BatchIndexOutOfRange {
                field,
                index: batch_index,
                len: values.len(),
            })?
            .as_str(),
    };
    Ok(if text.is_empty() { None } else { Some(text) })
}

// ============================================================================
// Property mapping
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Namespace {
    Dc,
    Photoshop,
    Exif,
    Iptc4xmpCore,
}

impl Namespace {
    const ORDER: [Namespace; 4] = [
        Namespace::Dc,
        Namespace::Photoshop,
        Namespace::Exif,
        Namespace::Iptc4xmpCore,
    ];

    fn prefix(&self) -> &'static str {
        match self {
            Self::Dc => "dc",
            Self::Photoshop => "photoshop",
            Self::Exif => "exif",
            Self::Iptc4xmpCore => "Iptc4xmpCore",
        }
    }

    fn uri(&self) -> &'static str {
        match self {
            Self::Dc => "http://purl.org/dc/elements/1.1/",
            Self::Photoshop => "http://ns.adobe.com/photoshop/1.0/",
            Self::Exif => "http://ns.adobe.com/exif/1.0/",
            Self::Iptc4xmpCore => "http://iptc.org/std/Iptc4xmpCore/1.0/xmlns/",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Container {
    /// Ordered array (`rdf:Seq`).
    Seq,
    /// Unordered array, one item per comma-separated keyword.
    Bag,
    /// Language alternative with a single `x-default` entry.
    Alt,
    Text,
}

struct Property {
    field: MetadataField,
    namespace: Namespace,
    name: &'static str,
    container: Container,
}

static PROPERTIES: [Property; 9] = [
    Property {
        field: MetadataField::Creator,
        namespace: Namespace::Dc,
        name: "creator",
        container: Container::Seq,
    },
    Property {
        field: MetadataField::Rights,
        namespace: Namespace::Dc,
        name: "rights",
        container: Container::Alt,
    },
    Property {
        field: MetadataField::Title,
        namespace: Namespace::Dc,
        name: "title",
        container: Container::Alt,
    },
    Property {
        field: MetadataField::Description,
        namespace: Namespace::Dc,
        name: "description",
        container: Container::Alt,
    },
    Property {
        field: MetadataField::Subject,
        namespace: Namespace::Dc,
        name: "subject",
        container: Container::Bag,
    },
    Property {
        field: MetadataField::Instructions,
        namespace: Namespace::Photoshop,
        name: "Instructions",
        container: Container::Text,
    },
    Property {
        field: MetadataField::Comment,
        namespace: Namespace::Exif,
        name: "UserComment",
        container: Container::Alt,
    },
    Property {
        field: MetadataField::AltText,
        namespace: Namespace::Iptc4xmpCore,
        name: "AltTextAccessibility",
        container: Container::Alt,
    },
    Property {
        field: MetadataField::ExtDescription,
        namespace: Namespace::Iptc4xmpCore,
        name: "ExtDescrAccessibility",
        container: Container::Alt,
    },
];

/// Build the XMP packet for one batch item.
///
/// A non-empty `xml_string` is returned verbatim without looking at
/// `fields`. Otherwise every present field is written under its
/// Dublin Core / Photoshop / EXIF / IPTC property; absent fields leave
/// no element behind.
///
/// # Example
///
/// ```rust
/// use xmp_save::xmp::{XmpFields, build_xmp};
///
/// let fields = XmpFields {
///     creator: Some("Jane Doe".into()),
///     title: Some(vec!["Dawn", "Dusk"].into()),
///     ..Default::default()
/// };
/// let xmp = build_xmp(&fields, None, 1).unwrap();
/// assert!(xmp.contains("<rdf:li>Jane Doe</rdf:li>"));
/// assert!(xmp.contains("Dusk"));
/// assert!(!xmp.contains("Dawn"));
///
/// let raw = "<x:xmpmeta>custom</x:xmpmeta>";
/// assert_eq!(build_xmp(&fields, Some(raw), 0).unwrap(), raw);
/// ```
pub fn build_xmp(
    fields: &XmpFields,
    xml_string: Option<&str>,
    batch_index: usize,
) -> Result<String, SaveError> {
    if let Some(xml) = xml_string.filter(|s| !s.is_empty()) {
        return Ok(xml.to_string());
    }

    let mut present: Vec<(&Property, &str)> = Vec::new();
    for property in &PROPERTIES {
        if let Some(value) = fields.get(property.field) {
            if let Some(text) = resolve(value, property.field, batch_index)? {
                present.push((property, text));
            }
        }
    }

    let mut xmp = String::new();
    xmp.push_str("<?xpacket begin=\"\u{feff}\" id=\"W5M0MpCehiHzreSzNTczkc9d\"?>\n");
    xmp.push_str("<x:xmpmeta xmlns:x=\"adobe:ns:meta/\">\n");
    xmp.push_str("<rdf:RDF xmlns:rdf=\"http://www.w3.org/1999/02/22-rdf-syntax-ns#\">\n");
    xmp.push_str("<rdf:Description rdf:about=\"\"");
    for namespace in Namespace::ORDER {
        if present.iter().any(|(p, _)| p.namespace == namespace) {
            xmp.push_str(&format!(
                "\n  xmlns:{}=\"{}\"",
                namespace.prefix(),
                namespace.uri()
            ));
        }
    }
    xmp.push_str(">\n");

    for (property, text) in &present {
        push_property(&mut xmp, property, text);
    }

    xmp.push_str("</rdf:Description>\n");
    xmp.push_str("</rdf:RDF>\n");
    xmp.push_str("</x:xmpmeta>\n");
    xmp.push_str("<?xpacket end=\"w\"?>");
    Ok(xmp)
}

fn push_property(xmp: &mut String, property: &Property, text: &str) {
    let tag = format!("{}:{}", property.namespace.prefix(), property.name);
    match property.container {
        Container::Text => {
            xmp.push_str(&format!("  <{tag}>{}</{tag}>\n", xml_escape(text)));
        }
        Container::Alt => {
            xmp.push_str(&format!(
                "  <{tag}><rdf:Alt><rdf:li xml:lang=\"x-default\">{}</rdf:li></rdf:Alt></{tag}>\n",
                xml_escape(text)
            ));
        }
        Container::Seq => {
            xmp.push_str(&format!(
                "  <{tag}><rdf:Seq><rdf:li>{}</rdf:li></rdf:Seq></{tag}>\n",
                xml_escape(text)
            ));
        }
        Container::Bag => {
            let mut keywords: Vec<&str> = text
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .collect();
            if keywords.is_empty() {
                keywords.push(text);
            }
            xmp.push_str(&format!("  <{tag}><rdf:Bag>\n"));
            for keyword in keywords {
                xmp.push_str(&format!("    <rdf:li>{}</rdf:li>\n", xml_escape(keyword)));
            }
            xmp.push_str(&format!("  </rdf:Bag></{tag}>\n"));
        }
    }
}

/// Escape special XML characters.
fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
