//! PICS device snapshots.
//!
//! A PICS document captures a whole device tree as XML:
//! `sunSpecPics > device(addr) > model(id,len[,index]) > block(type[,index]) >
//! point(id[,impl,access])[text]`. Points the device does not implement carry `impl="false"`
//! and no text; all others carry their raw `value_base` as text.
//!
//! Parsing a snapshot and re-emitting it yields a structurally equal tree under
//! [`Device::diff`], which is how the test suite checks the offline and live-scan paths against
//! each other.

use crate::device::{Device, Model, ScaleFactor};
use crate::error::{Error, SchemaError};
use crate::pathlist::PathList;
use crate::smdx::{Access, BlockKind, ModelRegistry};
use crate::BASE_ADDR_DEFAULT;

const PICS_VERSION: &str = "1";

impl Device {
    /// Load a snapshot file found through the path list (or the plain filesystem when no path
    /// list is given).
    pub fn from_pics(
        filename: &str,
        pathlist: Option<&PathList>,
        registry: &ModelRegistry,
    ) -> Result<Device, Error> {
        let data = match pathlist {
            Some(pathlist) => pathlist.read(filename)?,
            None => std::fs::read(filename)?,
        };

        let text = String::from_utf8_lossy(&data);

        Self::from_pics_str(&text, registry)
    }

    /// Parse a snapshot document.
    pub fn from_pics_str(xml: &str, registry: &ModelRegistry) -> Result<Device, Error> {
        let doc = roxmltree::Document::parse(xml).map_err(SchemaError::from)?;
        let root = doc.root_element();

        if root.tag_name().name() != "sunSpecPics" {
            return Err(SchemaError::UnexpectedRoot(root.tag_name().name().to_string()).into());
        }

        let element = root
            .children()
            .find(|n| n.has_tag_name("device"))
            .ok_or(SchemaError::Attribute {
                element: "sunSpecPics",
                attribute: "device",
                value: None,
            })?;

        Self::from_pics_element(element, registry)
    }

    /// Build a device from a parsed `device` element.
    pub fn from_pics_element(
        element: roxmltree::Node<'_, '_>,
        registry: &ModelRegistry,
    ) -> Result<Device, Error> {
        let base_addr = match element.attribute("addr") {
            Some(addr) => addr.parse().map_err(|_| SchemaError::Attribute {
                element: "device",
                attribute: "addr",
                value: Some(addr.to_string()),
            })?,
            None => BASE_ADDR_DEFAULT,
        };

        let mut device = Device::new(Some(base_addr));
        let mut addr = base_addr + 2;

        for m in element.children().filter(|n| n.is_element()) {
            if m.tag_name().name() != "model" {
                return Err(SchemaError::UnexpectedElement {
                    element: m.tag_name().name().to_string(),
                    parent: "device".to_string(),
                }
                .into());
            }

            let id = m
                .attribute("id")
                .and_then(|id| id.parse().ok())
                .ok_or(SchemaError::Attribute {
                    element: "model",
                    attribute: "id",
                    value: m.attribute("id").map(str::to_string),
                })?;

            let len: u16 = match m.attribute("len") {
                Some(len) => len.parse().map_err(|_| SchemaError::Attribute {
                    element: "model",
                    attribute: "len",
                    value: Some(len.to_string()),
                })?,
                None => 0,
            };

            // Address bookkeeping mirrors a live chain walk even though snapshot addresses are
            // never used for I/O
            let mut model = Model::new(id, addr + 2, len);

            model.load(registry)?;
            model_from_pics(&mut model, m)?;

            let model_len = model.len();

            device.add_model(model);

            addr += model_len + 2;
        }

        Ok(device)
    }

    /// Serialise the device tree to a snapshot document.
    ///
    /// With `single_repeating` only the first repeating-block instance is emitted; reloading
    /// such a snapshot applies that block's values to every repeating instance.
    pub fn to_pics(&self, single_repeating: bool) -> String {
        let mut out = String::from("<sunSpecPics>\n");

        match self.base_addr() {
            Some(addr) => out.push_str(&format!(
                "  <device v=\"{}\" addr=\"{}\">\n",
                PICS_VERSION, addr
            )),
            None => out.push_str(&format!("  <device v=\"{}\">\n", PICS_VERSION)),
        }

        for model in self.models() {
            model_to_pics(model, single_repeating, &mut out);
        }

        out.push_str("  </device>\n</sunSpecPics>\n");

        out
    }
}

fn model_from_pics(model: &mut Model, element: roxmltree::Node<'_, '_>) -> Result<(), Error> {
    for b in element.children().filter(|n| n.is_element()) {
        if b.tag_name().name() != "block" {
            return Err(SchemaError::UnexpectedElement {
                element: b.tag_name().name().to_string(),
                parent: "model".to_string(),
            }
            .into());
        }

        let kind = match b.attribute("type").unwrap_or("fixed") {
            "fixed" => BlockKind::Fixed,
            "repeating" => BlockKind::Repeating,
            other => return Err(SchemaError::InvalidBlockType(other.to_string()).into()),
        };

        match kind {
            BlockKind::Fixed => {
                if let Some(block) = model.blocks_mut().first_mut() {
                    block_from_pics(block, b)?;
                }
            }
            BlockKind::Repeating => match b.attribute("index") {
                // Without an index the element applies to every repeating instance
                None => {
                    for block in model.blocks_mut().iter_mut().skip(1) {
                        block_from_pics(block, b)?;
                    }
                }
                Some(index) => {
                    let index: usize =
                        index.parse().map_err(|_| SchemaError::Attribute {
                            element: "block",
                            attribute: "index",
                            value: Some(index.to_string()),
                        })?;

                    let block = model
                        .blocks_mut()
                        .get_mut(index)
                        .filter(|block| block.index() > 0)
                        .ok_or(SchemaError::Attribute {
                            element: "block",
                            attribute: "index",
                            value: Some(index.to_string()),
                        })?;

                    block_from_pics(block, b)?;
                }
            },
        }
    }

    bind_snapshot_scale_factors(model);

    Ok(())
}

fn block_from_pics(
    block: &mut crate::device::Block,
    element: roxmltree::Node<'_, '_>,
) -> Result<(), Error> {
    for p in element.children().filter(|n| n.is_element()) {
        if p.tag_name().name() != "point" {
            return Err(SchemaError::UnexpectedElement {
                element: p.tag_name().name().to_string(),
                parent: "block".to_string(),
            }
            .into());
        }

        let Some(id) = p.attribute("id") else {
            continue;
        };

        let Some(point) = block.any_point_mut(id) else {
            // Points unknown to the model definition are ignored, as on a live read
            continue;
        };

        if p.attribute("impl") == Some("false") {
            point.set_value_base(None);

            continue;
        }

        let Some(text) = p.text() else {
            continue;
        };

        let kind = point.point_type().kind;
        let value = sunspec_wire::value_from_str(kind, text)?;

        if sunspec_wire::is_implemented(kind, &value) {
            point.set_value_base(Some(value));
        } else {
            point.set_value_base(None);
        }
    }

    Ok(())
}

/// Bind `value_sf` on every implemented point, mirroring what a live decode does.
fn bind_snapshot_scale_factors(model: &mut Model) {
    let sf_values: Vec<Vec<(String, Option<i16>)>> = model
        .blocks()
        .iter()
        .map(|block| {
            block
                .points_sf()
                .iter()
                .map(|p| {
                    let value = p.value_base().and_then(|v| v.as_i64()).map(|v| v as i16);

                    (p.id().to_string(), value)
                })
                .collect()
        })
        .collect();

    for block in model.blocks_mut() {
        for point in block.points_mut() {
            if point.value_base().is_none() {
                point.set_value_sf(None);

                continue;
            }

            let sf = match point.scale_factor() {
                None => None,
                Some(ScaleFactor::Constant(constant)) => Some(*constant),
                Some(ScaleFactor::Point { block, id }) => sf_values[*block]
                    .iter()
                    .find(|(sf_id, _)| sf_id == id)
                    .and_then(|(_, value)| *value),
            };

            point.set_value_sf(sf);
        }
    }
}

fn model_to_pics(model: &Model, single_repeating: bool, out: &mut String) {
    if model.index() != 1 {
        out.push_str(&format!(
            "    <model id=\"{}\" len=\"{}\" index=\"{}\">\n",
            model.id(),
            model.len(),
            model.index()
        ));
    } else {
        out.push_str(&format!(
            "    <model id=\"{}\" len=\"{}\">\n",
            model.id(),
            model.len()
        ));
    }

    for block in model.blocks() {
        if single_repeating && block.index() > 1 {
            continue;
        }

        let mut attrs = String::new();

        if block.index() > 1 {
            attrs.push_str(&format!(" index=\"{}\"", block.index()));
        }

        if block.block_type().kind == BlockKind::Repeating {
            attrs.push_str(" type=\"repeating\"");
        }

        out.push_str(&format!("      <block{}>\n", attrs));

        // The definition's point order keeps snapshots byte-stable across runs
        for point_type in &block.block_type().points {
            let point = block
                .point(&point_type.id)
                .or_else(|| block.sf_point(&point_type.id));

            let Some(point) = point else {
                continue;
            };

            match point.value_base() {
                None => out.push_str(&format!(
                    "        <point id=\"{}\" impl=\"false\" />\n",
                    escape(point.id())
                )),
                Some(value) => {
                    let access = if point.point_type().access == Access::Rw {
                        " access=\"rw\""
                    } else {
                        ""
                    };

                    out.push_str(&format!(
                        "        <point id=\"{}\"{}>{}</point>\n",
                        escape(point.id()),
                        access,
                        escape(&value.to_string())
                    ));
                }
            }
        }

        out.push_str("      </block>\n");
    }

    out.push_str("    </model>\n");
}

/// Minimal XML text/attribute escaping.
pub(crate) fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());

    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }

    out
}
