//! SMDX model-definition loader.
//!
//! An SMDX document is rooted at `sunSpecModels` and defines one model: its `model` element
//! carries at most one `fixed` and one `repeating` block, each a list of `point` elements binding
//! a point id to a register offset, type and access. A sibling `strings` element carries the
//! human-readable labels for the `en` locale.
//!
//! Loaded definitions are immutable and shared: a [`ModelRegistry`] caches them by id for the
//! lifetime of the process, resolving unknown ids to `smdx_<id:05>.xml` through a [`PathList`].

use crate::error::{Error, SchemaError};
use crate::pathlist::PathList;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};
use sunspec_wire::PointKind;

/// Point access from the Modbus master's point of view.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Access {
    /// Read-only.
    #[default]
    R,
    /// Read/write.
    Rw,
}

/// Position of a block within a model.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BlockKind {
    /// The single fixed block at the start of every model.
    Fixed,
    /// The optionally repeated block following the fixed block.
    Repeating,
}

impl core::fmt::Display for BlockKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            BlockKind::Fixed => f.write_str("fixed"),
            BlockKind::Repeating => f.write_str("repeating"),
        }
    }
}

/// A named constant in a point's enum/bitfield vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    /// Symbol name.
    pub id: String,
    /// The constant's value text.
    pub value: String,
    /// Label from the strings section.
    pub label: Option<String>,
    /// Description from the strings section.
    pub description: Option<String>,
    /// Notes from the strings section.
    pub notes: Option<String>,
}

/// The definition of one point within a block.
#[derive(Debug, Clone, PartialEq)]
pub struct PointType {
    /// Point id, unique within its block.
    pub id: String,
    /// Register offset within the block.
    pub offset: u16,
    /// Scalar type.
    pub kind: PointKind,
    /// Register width. Fixed by the type except for `string` points.
    pub len: u16,
    /// Whether a conforming device must implement the point.
    pub mandatory: bool,
    /// Read-only or read/write.
    pub access: Access,
    /// Unit of measure.
    pub units: Option<String>,
    /// Scale-factor reference: an integer literal or the id of a `sunssf` point.
    pub sf: Option<String>,
    /// Label from the strings section.
    pub label: Option<String>,
    /// Description from the strings section.
    pub description: Option<String>,
    /// Notes from the strings section.
    pub notes: Option<String>,
    /// Enum/bitfield vocabulary.
    pub symbols: Vec<Symbol>,
}

impl PointType {
    /// Deep comparison. Returns a diagnostic string on the first mismatch, `None` on equality.
    pub fn diff(&self, other: &PointType) -> Option<String> {
        if self == other {
            return None;
        }

        Some(format!(
            "point type '{}' not equal: {:?} {:?}",
            self.id, self, other
        ))
    }
}

/// The definition of one block within a model.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockType {
    /// Fixed or repeating.
    pub kind: BlockKind,
    /// Register length of one block instance.
    pub len: u16,
    /// Block name; defaults to the block kind.
    pub name: String,
    /// Point definitions in declaration order.
    pub points: Vec<Arc<PointType>>,
}

impl BlockType {
    fn empty(kind: BlockKind) -> Self {
        Self {
            kind,
            len: 0,
            name: kind.to_string(),
            points: Vec::new(),
        }
    }

    /// Look up a point definition by id.
    pub fn point(&self, id: &str) -> Option<&Arc<PointType>> {
        self.points.iter().find(|p| p.id == id)
    }

    /// Deep comparison. Returns a diagnostic string on the first mismatch, `None` on equality.
    pub fn diff(&self, other: &BlockType) -> Option<String> {
        if self.kind != other.kind {
            return Some(format!(
                "block type kind not equal: {} {}",
                self.kind, other.kind
            ));
        }

        if self.len != other.len {
            return Some(format!(
                "block type '{}' len not equal: {} {}",
                self.kind, self.len, other.len
            ));
        }

        if self.points.len() != other.points.len() {
            return Some(format!("block type '{}' point count not equal", self.kind));
        }

        self.points
            .iter()
            .zip(other.points.iter())
            .find_map(|(a, b)| a.diff(b))
    }
}

/// The loaded definition of one SunSpec model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelType {
    /// Model id.
    pub id: u16,
    /// Register length of the model payload as declared by the definition.
    pub len: u16,
    /// Model name; defaults to `model_<id>`.
    pub name: String,
    /// Label from the strings section.
    pub label: Option<String>,
    /// Description from the strings section.
    pub description: Option<String>,
    /// Notes from the strings section.
    pub notes: Option<String>,
    /// The fixed block. Synthesized as empty when the definition declares none so downstream
    /// code can always reach it.
    pub fixed_block: Arc<BlockType>,
    /// The repeating block, if any.
    pub repeating_block: Option<Arc<BlockType>>,
}

impl ModelType {
    /// Parse a model definition from SMDX text.
    pub fn from_smdx_str(xml: &str) -> Result<Self, Error> {
        let doc = roxmltree::Document::parse(xml).map_err(SchemaError::from)?;

        Self::from_smdx(doc.root_element())
    }

    /// Parse a model definition from a parsed `sunSpecModels` element.
    pub fn from_smdx(root: roxmltree::Node<'_, '_>) -> Result<Self, Error> {
        if root.tag_name().name() != "sunSpecModels" {
            return Err(SchemaError::UnexpectedRoot(root.tag_name().name().to_string()).into());
        }

        let model = root
            .children()
            .find(|n| n.has_tag_name("model"))
            .ok_or(SchemaError::Attribute {
                element: "sunSpecModels",
                attribute: "model",
                value: None,
            })?;

        let id = parse_attr_u16(model, "model", "id")?;
        let len = parse_attr_u16(model, "model", "len")?;
        let name = model
            .attribute("name")
            .map(str::to_string)
            .unwrap_or_else(|| format!("model_{}", id));

        let mut fixed_block: Option<BlockType> = None;
        let mut repeating_block: Option<BlockType> = None;

        for block in model.children().filter(|n| n.has_tag_name("block")) {
            let block = parse_block(block)?;

            match block.kind {
                BlockKind::Fixed if fixed_block.is_some() => {
                    return Err(SchemaError::DuplicateFixedBlock.into());
                }
                BlockKind::Repeating if repeating_block.is_some() => {
                    return Err(SchemaError::DuplicateRepeatingBlock.into());
                }
                BlockKind::Fixed => fixed_block = Some(block),
                BlockKind::Repeating => repeating_block = Some(block),
            }
        }

        let mut fixed_block = fixed_block.unwrap_or_else(|| BlockType::empty(BlockKind::Fixed));

        let mut model_type = ModelType {
            id,
            len,
            name,
            label: None,
            description: None,
            notes: None,
            fixed_block: Arc::new(BlockType::empty(BlockKind::Fixed)),
            repeating_block: None,
        };

        apply_strings(
            root,
            id,
            &mut model_type,
            &mut fixed_block,
            &mut repeating_block,
        );

        model_type.fixed_block = Arc::new(fixed_block);
        model_type.repeating_block = repeating_block.map(Arc::new);

        Ok(model_type)
    }

    /// Deep comparison. Returns a diagnostic string on the first mismatch, `None` on equality.
    pub fn diff(&self, other: &ModelType) -> Option<String> {
        if self.id != other.id {
            return Some(format!("model type id not equal: {} {}", self.id, other.id));
        }

        if self.len != other.len {
            return Some(format!(
                "model type {} len not equal: {} {}",
                self.id, self.len, other.len
            ));
        }

        if self.label != other.label {
            return Some(format!(
                "model type {} label not equal: {:?} {:?}",
                self.id, self.label, other.label
            ));
        }

        if let Some(diff) = self.fixed_block.diff(&other.fixed_block) {
            return Some(diff);
        }

        match (&self.repeating_block, &other.repeating_block) {
            (Some(a), Some(b)) => a.diff(b),
            (None, None) => None,
            _ => Some(format!("model type {} repeating block mismatch", self.id)),
        }
    }
}

fn parse_attr_u16(
    node: roxmltree::Node<'_, '_>,
    element: &'static str,
    attribute: &'static str,
) -> Result<u16, Error> {
    let raw = node.attribute(attribute).ok_or(SchemaError::Attribute {
        element,
        attribute,
        value: None,
    })?;

    raw.parse().map_err(|_| {
        SchemaError::Attribute {
            element,
            attribute,
            value: Some(raw.to_string()),
        }
        .into()
    })
}

fn parse_block(node: roxmltree::Node<'_, '_>) -> Result<BlockType, Error> {
    let kind = match node.attribute("type").unwrap_or("fixed") {
        "fixed" => BlockKind::Fixed,
        "repeating" => BlockKind::Repeating,
        other => return Err(SchemaError::InvalidBlockType(other.to_string()).into()),
    };

    let len = parse_attr_u16(node, "block", "len")?;
    let name = node
        .attribute("name")
        .map(str::to_string)
        .unwrap_or_else(|| kind.to_string());

    let mut points: Vec<Arc<PointType>> = Vec::new();

    for point in node.children().filter(|n| n.has_tag_name("point")) {
        let point = parse_point(point)?;

        if points.iter().any(|p| p.id == point.id) {
            return Err(SchemaError::DuplicatePoint(point.id).into());
        }

        points.push(Arc::new(point));
    }

    Ok(BlockType {
        kind,
        len,
        name,
        points,
    })
}

fn parse_point(node: roxmltree::Node<'_, '_>) -> Result<PointType, Error> {
    let id = node
        .attribute("id")
        .ok_or(SchemaError::Attribute {
            element: "point",
            attribute: "id",
            value: None,
        })?
        .to_string();

    let offset = node
        .attribute("offset")
        .ok_or_else(|| SchemaError::MissingOffset(id.clone()))?
        .parse()
        .map_err(|_| SchemaError::MissingOffset(id.clone()))?;

    let type_name = node
        .attribute("type")
        .ok_or_else(|| SchemaError::MissingType(id.clone()))?;

    let kind = PointKind::from_name(type_name).ok_or_else(|| SchemaError::UnknownPointType {
        point: id.clone(),
        name: type_name.to_string(),
    })?;

    let len = match (kind.registers(), node.attribute("len")) {
        (_, Some(len)) => len.parse().map_err(|_| SchemaError::Attribute {
            element: "point",
            attribute: "len",
            value: Some(len.to_string()),
        })?,
        (Some(len), None) => len,
        (None, None) => return Err(SchemaError::MissingStringLen(id).into()),
    };

    let mandatory = match node.attribute("mandatory").unwrap_or("false") {
        "true" => true,
        "false" => false,
        other => {
            return Err(SchemaError::Attribute {
                element: "point",
                attribute: "mandatory",
                value: Some(other.to_string()),
            }
            .into());
        }
    };

    let access = match node.attribute("access").unwrap_or("r") {
        "r" => Access::R,
        "rw" => Access::Rw,
        other => {
            return Err(SchemaError::Attribute {
                element: "point",
                attribute: "access",
                value: Some(other.to_string()),
            }
            .into());
        }
    };

    let mut point = PointType {
        id,
        offset,
        kind,
        len,
        mandatory,
        access,
        units: node.attribute("units").map(str::to_string),
        sf: node.attribute("sf").map(str::to_string),
        label: None,
        description: None,
        notes: None,
        symbols: Vec::new(),
    };

    for child in node.children().filter(|n| n.is_element()) {
        match child.tag_name().name() {
            "symbol" => {
                if let Some(symbol_id) = child.attribute("id") {
                    point.symbols.push(Symbol {
                        id: symbol_id.to_string(),
                        value: child.text().unwrap_or("").trim().to_string(),
                        label: None,
                        description: None,
                        notes: None,
                    });
                }
            }
            "label" => point.label = child.text().map(str::to_string),
            "description" => point.description = child.text().map(str::to_string),
            "notes" => point.notes = child.text().map(str::to_string),
            _ => {}
        }
    }

    Ok(point)
}

/// Merge the `en`-locale strings section into the model and point definitions.
fn apply_strings(
    root: roxmltree::Node<'_, '_>,
    model_id: u16,
    model_type: &mut ModelType,
    fixed_block: &mut BlockType,
    repeating_block: &mut Option<BlockType>,
) {
    for strings in root.children().filter(|n| n.has_tag_name("strings")) {
        if strings.attribute("id") != Some(model_id.to_string().as_str()) {
            continue;
        }

        if strings
            .attribute("locale")
            .is_some_and(|locale| locale != "en")
        {
            continue;
        }

        if let Some(model) = strings.children().find(|n| n.has_tag_name("model")) {
            for child in model.children().filter(|n| n.is_element()) {
                let text = child.text().map(str::to_string);

                match child.tag_name().name() {
                    "label" => model_type.label = text,
                    "description" => model_type.description = text,
                    "notes" => model_type.notes = text,
                    _ => {}
                }
            }
        }

        for point in strings.children().filter(|n| n.has_tag_name("point")) {
            let Some(point_id) = point.attribute("id") else {
                continue;
            };

            let target = block_point_mut(fixed_block, point_id).or_else(|| {
                repeating_block
                    .as_mut()
                    .and_then(|block| block_point_mut(block, point_id))
            });

            let Some(target) = target else { continue };

            for child in point.children().filter(|n| n.is_element()) {
                let text = child.text().map(str::to_string);

                match child.tag_name().name() {
                    "label" => target.label = text,
                    "description" => target.description = text,
                    "notes" => target.notes = text,
                    "symbol" => {
                        let Some(symbol_id) = child.attribute("id") else {
                            continue;
                        };

                        let Some(symbol) =
                            target.symbols.iter_mut().find(|s| s.id == symbol_id)
                        else {
                            continue;
                        };

                        for part in child.children().filter(|n| n.is_element()) {
                            let text = part.text().map(str::to_string);

                            match part.tag_name().name() {
                                "label" => symbol.label = text,
                                "description" => symbol.description = text,
                                "notes" => symbol.notes = text,
                                _ => {}
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

fn block_point_mut<'a>(block: &'a mut BlockType, id: &str) -> Option<&'a mut PointType> {
    block
        .points
        .iter_mut()
        .find(|p| p.id == id)
        .map(Arc::make_mut)
}

/// The canonical filename of a model definition, `smdx_<id:05>.xml`.
pub fn model_filename(model_id: u16) -> String {
    format!("smdx_{:05}.xml", model_id)
}

/// Recover a model id from a definition filename.
pub fn model_id_from_filename(filename: &str) -> Option<u16> {
    filename
        .strip_prefix("smdx_")?
        .strip_suffix(".xml")?
        .parse()
        .ok()
}

/// A cache of loaded model definitions keyed by id.
///
/// Definitions are resolved by filename through the registry's path list on first reference and
/// cached for the life of the registry. Pass a registry into device constructors to keep tests
/// hermetic; [`ModelRegistry::global`] provides the conventional process-wide default.
pub struct ModelRegistry {
    pathlist: Mutex<PathList>,
    cache: Mutex<HashMap<u16, Arc<ModelType>>>,
}

impl ModelRegistry {
    /// Create a registry resolving definitions through `pathlist`.
    pub fn new(pathlist: PathList) -> Self {
        Self {
            pathlist: Mutex::new(pathlist),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide default registry, searching the working directory and `models/smdx`.
    pub fn global() -> Arc<ModelRegistry> {
        static GLOBAL: LazyLock<Arc<ModelRegistry>> = LazyLock::new(|| {
            Arc::new(ModelRegistry::new(PathList::from_paths([
                ".",
                "models",
                "models/smdx",
            ])))
        });

        Arc::clone(&GLOBAL)
    }

    /// Replace the registry's path list. Cached definitions are kept.
    pub fn set_pathlist(&self, pathlist: PathList) {
        *self.pathlist.lock().unwrap_or_else(|e| e.into_inner()) = pathlist;
    }

    /// Fetch the definition for `model_id`, loading and caching it on first reference.
    pub fn get(&self, model_id: u16) -> Result<Arc<ModelType>, Error> {
        {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());

            if let Some(model_type) = cache.get(&model_id) {
                return Ok(Arc::clone(model_type));
            }
        }

        let filename = model_filename(model_id);

        let data = {
            let pathlist = self.pathlist.lock().unwrap_or_else(|e| e.into_inner());

            pathlist.read(&filename)?
        };

        let text = String::from_utf8_lossy(&data);
        let model_type = Arc::new(ModelType::from_smdx_str(&text)?);

        log::debug!("loaded model definition {} from {}", model_type.id, filename);

        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(model_id, Arc::clone(&model_type));

        Ok(model_type)
    }

    /// Insert an already-built definition, e.g. one parsed from an inline document.
    pub fn insert(&self, model_type: ModelType) -> Arc<ModelType> {
        let model_type = Arc::new(model_type);

        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(model_type.id, Arc::clone(&model_type));

        model_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMDX: &str = r#"
<sunSpecModels v="1">
  <model id="63010" len="6" name="test_model">
    <block len="4">
      <point id="SF_A" offset="0" type="sunssf" />
      <point id="A" offset="1" type="int16" sf="SF_A" units="W" mandatory="true" />
      <point id="St" offset="2" type="enum16">
        <symbol id="OFF">1</symbol>
        <symbol id="ON">2</symbol>
      </point>
      <point id="Rsvd" offset="3" type="pad" />
    </block>
    <block type="repeating" len="2">
      <point id="B" offset="0" type="uint16" access="rw" />
      <point id="SF_B" offset="1" type="sunssf" />
    </block>
  </model>
  <strings id="63010" locale="en">
    <model>
      <label>Test model</label>
      <description>A model for loader tests</description>
    </model>
    <point id="A">
      <label>Point A</label>
    </point>
    <point id="St">
      <symbol id="ON">
        <label>Running</label>
      </symbol>
    </point>
  </strings>
</sunSpecModels>
"#;

    #[test]
    fn parses_blocks_points_and_strings() {
        let mt = ModelType::from_smdx_str(SMDX).unwrap();

        assert_eq!(mt.id, 63010);
        assert_eq!(mt.len, 6);
        assert_eq!(mt.name, "test_model");
        assert_eq!(mt.label.as_deref(), Some("Test model"));

        let fixed = &mt.fixed_block;

        assert_eq!(fixed.kind, BlockKind::Fixed);
        assert_eq!(fixed.len, 4);
        assert_eq!(fixed.points.len(), 4);

        let a = fixed.point("A").unwrap();

        assert_eq!(a.offset, 1);
        assert_eq!(a.kind, PointKind::Int16);
        assert_eq!(a.sf.as_deref(), Some("SF_A"));
        assert_eq!(a.units.as_deref(), Some("W"));
        assert!(a.mandatory);
        assert_eq!(a.label.as_deref(), Some("Point A"));

        let st = fixed.point("St").unwrap();

        assert_eq!(st.symbols.len(), 2);
        assert_eq!(st.symbols[1].value, "2");
        assert_eq!(st.symbols[1].label.as_deref(), Some("Running"));

        let repeating = mt.repeating_block.as_ref().unwrap();

        assert_eq!(repeating.kind, BlockKind::Repeating);
        assert_eq!(repeating.point("B").unwrap().access, Access::Rw);
    }

    #[test]
    fn block_len_equals_sum_of_point_widths() {
        let mt = ModelType::from_smdx_str(SMDX).unwrap();

        for block in [Some(&mt.fixed_block), mt.repeating_block.as_ref()]
            .into_iter()
            .flatten()
        {
            let total: u16 = block.points.iter().map(|p| p.len).sum();

            assert_eq!(total, block.len);
        }
    }

    #[test]
    fn loading_twice_is_deep_equal() {
        let a = ModelType::from_smdx_str(SMDX).unwrap();
        let b = ModelType::from_smdx_str(SMDX).unwrap();

        assert_eq!(a.diff(&b), None);
        assert_eq!(a, b);
    }

    #[test]
    fn missing_fixed_block_is_synthesized_empty() {
        let xml = r#"
<sunSpecModels v="1">
  <model id="63011" len="2">
    <block type="repeating" len="2">
      <point id="B" offset="0" type="uint32" />
    </block>
  </model>
</sunSpecModels>
"#;

        let mt = ModelType::from_smdx_str(xml).unwrap();

        assert_eq!(mt.fixed_block.points.len(), 0);
        assert_eq!(mt.fixed_block.len, 0);
        assert!(mt.repeating_block.is_some());
    }

    #[test]
    fn duplicate_point_fails() {
        let xml = r#"
<sunSpecModels>
  <model id="63012" len="2">
    <block len="2">
      <point id="A" offset="0" type="int16" />
      <point id="A" offset="1" type="int16" />
    </block>
  </model>
</sunSpecModels>
"#;

        assert!(matches!(
            ModelType::from_smdx_str(xml),
            Err(Error::Schema(SchemaError::DuplicatePoint(id))) if id == "A"
        ));
    }

    #[test]
    fn unknown_point_type_fails() {
        let xml = r#"
<sunSpecModels>
  <model id="63013" len="1">
    <block len="1">
      <point id="A" offset="0" type="float64" />
    </block>
  </model>
</sunSpecModels>
"#;

        assert!(matches!(
            ModelType::from_smdx_str(xml),
            Err(Error::Schema(SchemaError::UnknownPointType { .. }))
        ));
    }

    #[test]
    fn string_without_len_fails() {
        let xml = r#"
<sunSpecModels>
  <model id="63014" len="8">
    <block len="8">
      <point id="Mn" offset="0" type="string" />
    </block>
  </model>
</sunSpecModels>
"#;

        assert!(matches!(
            ModelType::from_smdx_str(xml),
            Err(Error::Schema(SchemaError::MissingStringLen(id))) if id == "Mn"
        ));
    }

    #[test]
    fn missing_offset_fails() {
        let xml = r#"
<sunSpecModels>
  <model id="63015" len="1">
    <block len="1">
      <point id="A" type="int16" />
    </block>
  </model>
</sunSpecModels>
"#;

        assert!(matches!(
            ModelType::from_smdx_str(xml),
            Err(Error::Schema(SchemaError::MissingOffset(id))) if id == "A"
        ));
    }

    #[test]
    fn filename_mapping() {
        assert_eq!(model_filename(1), "smdx_00001.xml");
        assert_eq!(model_filename(63001), "smdx_63001.xml");
        assert_eq!(model_id_from_filename("smdx_00001.xml"), Some(1));
        assert_eq!(model_id_from_filename("smdx_abc.xml"), None);
        assert_eq!(model_id_from_filename("pics_device.xml"), None);
    }

    #[test]
    fn registry_caches_by_id() {
        let registry = ModelRegistry::new(PathList::new());

        registry.insert(ModelType::from_smdx_str(SMDX).unwrap());

        let first = registry.get(63010).unwrap();
        let second = registry.get(63010).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn registry_miss_is_name_error() {
        let registry = ModelRegistry::new(PathList::new());

        assert!(matches!(
            registry.get(64999),
            Err(Error::NotFound(name)) if name == "smdx_64999.xml"
        ));
    }
}
