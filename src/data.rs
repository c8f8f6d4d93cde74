//! SDX telemetry records.
//!
//! The SunSpec data exchange format is the XML a logger emits when it uploads readings:
//! `sunSpecData > d(lid,man,mod,sn,t,…) > m(id[,x]) > p(id[,sf,t])[value]`. Element and
//! attribute names are single letters to keep upload payloads small.

use crate::error::{Error, SchemaError};
use crate::pics::escape;

/// A `sunSpecData` document: one upload containing any number of device records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SunSpecData {
    /// Format version.
    pub version: Option<String>,
    /// Device records.
    pub devices: Vec<DeviceData>,
}

/// One device record (`d` element).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceData {
    /// Logger id.
    pub logger_id: Option<String>,
    /// Logger id namespace.
    pub namespace: Option<String>,
    /// Device id.
    pub device_id: Option<String>,
    /// Interface id.
    pub ifc: Option<String>,
    /// Manufacturer.
    pub man: Option<String>,
    /// Model name.
    pub mod_: Option<String>,
    /// Serial number.
    pub sn: Option<String>,
    /// Record timestamp, RFC 3339.
    pub timestamp: Option<String>,
    /// Correlation id.
    pub cid: Option<String>,
    /// Model records.
    pub models: Vec<ModelData>,
}

/// One model record (`m` element).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelData {
    /// Model id.
    pub model_id: String,
    /// Model namespace.
    pub namespace: Option<String>,
    /// Model instance index.
    pub index: Option<String>,
    /// Point records.
    pub points: Vec<PointData>,
}

/// One point record (`p` element).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PointData {
    /// Point id.
    pub point_id: String,
    /// Repeating-block instance index.
    pub index: Option<String>,
    /// Scale factor applied to the value.
    pub sf: Option<String>,
    /// Sample timestamp.
    pub time: Option<String>,
    /// The point's value text.
    pub value: Option<String>,
}

impl SunSpecData {
    /// Create an empty record set.
    pub fn new() -> Self {
        Self {
            version: Some("1".to_string()),
            devices: Vec::new(),
        }
    }

    /// Append a device record and return it for population.
    pub fn device_add(&mut self, device: DeviceData) -> &mut DeviceData {
        self.devices.push(device);

        self.devices.last_mut().expect("just pushed")
    }

    /// Parse a `sunSpecData` document.
    pub fn from_xml(xml: &str) -> Result<Self, Error> {
        let doc = roxmltree::Document::parse(xml).map_err(SchemaError::from)?;
        let root = doc.root_element();

        if root.tag_name().name() != "sunSpecData" {
            return Err(SchemaError::UnexpectedRoot(root.tag_name().name().to_string()).into());
        }

        let mut data = SunSpecData {
            version: root.attribute("v").map(str::to_string),
            devices: Vec::new(),
        };

        for d in root.children().filter(|n| n.is_element()) {
            if d.tag_name().name() != "d" {
                return Err(SchemaError::UnexpectedElement {
                    element: d.tag_name().name().to_string(),
                    parent: "sunSpecData".to_string(),
                }
                .into());
            }

            data.devices.push(DeviceData::from_element(d)?);
        }

        Ok(data)
    }

    /// Serialise to a `sunSpecData` document.
    pub fn to_xml(&self) -> String {
        let mut out = match &self.version {
            Some(version) => format!("<sunSpecData v=\"{}\">\n", escape(version)),
            None => "<sunSpecData>\n".to_string(),
        };

        for device in &self.devices {
            device.to_xml(&mut out);
        }

        out.push_str("</sunSpecData>\n");

        out
    }
}

impl DeviceData {
    /// Append a model record and return it for population.
    pub fn model_add(&mut self, model: ModelData) -> &mut ModelData {
        self.models.push(model);

        self.models.last_mut().expect("just pushed")
    }

    fn from_element(element: roxmltree::Node<'_, '_>) -> Result<Self, Error> {
        let mut device = DeviceData {
            logger_id: element.attribute("lid").map(str::to_string),
            namespace: element.attribute("ns").map(str::to_string),
            device_id: element.attribute("id").map(str::to_string),
            ifc: element.attribute("if").map(str::to_string),
            man: element.attribute("man").map(str::to_string),
            mod_: element.attribute("mod").map(str::to_string),
            sn: element.attribute("sn").map(str::to_string),
            timestamp: element.attribute("t").map(str::to_string),
            cid: element.attribute("cid").map(str::to_string),
            models: Vec::new(),
        };

        for m in element.children().filter(|n| n.is_element()) {
            if m.tag_name().name() != "m" {
                return Err(SchemaError::UnexpectedElement {
                    element: m.tag_name().name().to_string(),
                    parent: "d".to_string(),
                }
                .into());
            }

            device.models.push(ModelData::from_element(m)?);
        }

        Ok(device)
    }

    fn to_xml(&self, out: &mut String) {
        out.push_str("  <d");

        for (name, value) in [
            ("lid", &self.logger_id),
            ("ns", &self.namespace),
            ("id", &self.device_id),
            ("if", &self.ifc),
            ("man", &self.man),
            ("mod", &self.mod_),
            ("sn", &self.sn),
            ("t", &self.timestamp),
            ("cid", &self.cid),
        ] {
            if let Some(value) = value {
                out.push_str(&format!(" {}=\"{}\"", name, escape(value)));
            }
        }

        out.push_str(">\n");

        for model in &self.models {
            model.to_xml(out);
        }

        out.push_str("  </d>\n");
    }
}

impl ModelData {
    /// Create a model record for `model_id`.
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            ..Self::default()
        }
    }

    /// Append a point record.
    pub fn point_add(&mut self, point: PointData) {
        self.points.push(point);
    }

    fn from_element(element: roxmltree::Node<'_, '_>) -> Result<Self, Error> {
        let mut model = ModelData {
            model_id: element.attribute("id").unwrap_or_default().to_string(),
            namespace: element.attribute("ns").map(str::to_string),
            index: element.attribute("x").map(str::to_string),
            points: Vec::new(),
        };

        for p in element.children().filter(|n| n.is_element()) {
            if p.tag_name().name() != "p" {
                return Err(SchemaError::UnexpectedElement {
                    element: p.tag_name().name().to_string(),
                    parent: "m".to_string(),
                }
                .into());
            }

            model.points.push(PointData {
                point_id: p.attribute("id").unwrap_or_default().to_string(),
                index: p.attribute("index").map(str::to_string),
                sf: p.attribute("sf").map(str::to_string),
                time: p.attribute("t").map(str::to_string),
                value: p.text().map(str::to_string),
            });
        }

        Ok(model)
    }

    fn to_xml(&self, out: &mut String) {
        out.push_str(&format!("    <m id=\"{}\"", escape(&self.model_id)));

        if let Some(index) = &self.index {
            out.push_str(&format!(" x=\"{}\"", escape(index)));
        }

        if let Some(namespace) = &self.namespace {
            out.push_str(&format!(" ns=\"{}\"", escape(namespace)));
        }

        out.push_str(">\n");

        for point in &self.points {
            point.to_xml(out);
        }

        out.push_str("    </m>\n");
    }
}

impl PointData {
    /// Create a point record carrying `value`.
    pub fn new(point_id: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            point_id: point_id.into(),
            value: Some(value.into()),
            ..Self::default()
        }
    }

    fn to_xml(&self, out: &mut String) {
        out.push_str(&format!("      <p id=\"{}\"", escape(&self.point_id)));

        if let Some(index) = &self.index {
            out.push_str(&format!(" index=\"{}\"", escape(index)));
        }

        if let Some(sf) = &self.sf {
            out.push_str(&format!(" sf=\"{}\"", escape(sf)));
        }

        if let Some(time) = &self.time {
            out.push_str(&format!(" t=\"{}\"", escape(time)));
        }

        match &self.value {
            Some(value) => out.push_str(&format!(">{}</p>\n", escape(value))),
            None => out.push_str(" />\n"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let mut data = SunSpecData::new();

        let device = data.device_add(DeviceData {
            logger_id: Some("logger-1".to_string()),
            man: Some("SunSpecTest".to_string()),
            mod_: Some("TestDevice-1".to_string()),
            sn: Some("sn-123456789".to_string()),
            timestamp: Some("2018-03-01T14:25:51Z".to_string()),
            ..DeviceData::default()
        });

        let model = device.model_add(ModelData::new("63001"));

        model.point_add(PointData {
            sf: Some("1".to_string()),
            ..PointData::new("int16_4", "-2")
        });
        model.point_add(PointData::new("uint16_1", "4"));

        let xml = data.to_xml();
        let reparsed = SunSpecData::from_xml(&xml).unwrap();

        assert_eq!(data, reparsed);
    }

    #[test]
    fn parses_short_element_names() {
        let xml = r#"
<sunSpecData v="1">
  <d lid="11:22:33" man="acme" mod="m1" sn="s1" t="2018-03-01T00:00:00Z">
    <m id="101" x="2">
      <p id="W" sf="-1">4512</p>
    </m>
  </d>
</sunSpecData>
"#;

        let data = SunSpecData::from_xml(xml).unwrap();

        assert_eq!(data.devices.len(), 1);
        assert_eq!(data.devices[0].man.as_deref(), Some("acme"));

        let model = &data.devices[0].models[0];

        assert_eq!(model.model_id, "101");
        assert_eq!(model.index.as_deref(), Some("2"));
        assert_eq!(model.points[0].value.as_deref(), Some("4512"));
        assert_eq!(model.points[0].sf.as_deref(), Some("-1"));
    }

    #[test]
    fn unexpected_element_fails() {
        let xml = "<sunSpecData><device /></sunSpecData>";

        assert!(matches!(
            SunSpecData::from_xml(xml),
            Err(Error::Schema(SchemaError::UnexpectedElement { .. }))
        ));
    }
}
