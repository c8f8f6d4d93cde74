//! The in-memory device tree: Device → Model → Block → Point.
//!
//! A [`Device`] holds the models discovered by a scan or loaded from a snapshot. [`Model::load`]
//! performs the binder's structural work — instantiating blocks from the model definition,
//! binding points to absolute register addresses, resolving scale-factor references and
//! pre-computing read partitions — so the offline (snapshot) and online (live-read) paths share
//! the same code.

use crate::error::Error;
use crate::modbus::REQ_COUNT_MAX;
use crate::smdx::{BlockType, ModelRegistry, ModelType, PointType};
use std::sync::Arc;
use sunspec_wire::{PointKind, Value, WireError};

/// A resolved scale-factor binding.
///
/// Points do not hold references to their resolving `sunssf` point; the binding is looked up
/// through the owning model when values are decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleFactor {
    /// The definition referenced an integer literal.
    Constant(i16),
    /// The definition referenced a `sunssf` point.
    Point {
        /// Index of the block holding the scale-factor point: the point's own block, or 0 when a
        /// repeating-block point resolves into the fixed block.
        block: usize,
        /// Scale-factor point id.
        id: String,
    },
}

/// One point bound to an absolute register address.
#[derive(Debug, Clone)]
pub struct Point {
    point_type: Arc<PointType>,
    addr: u16,
    sf: Option<ScaleFactor>,
    value_base: Option<Value>,
    value_sf: Option<i16>,
    implemented: bool,
    dirty: bool,
}

impl Point {
    fn new(point_type: Arc<PointType>, addr: u16) -> Self {
        Self {
            point_type,
            addr,
            sf: None,
            value_base: None,
            value_sf: None,
            implemented: true,
            dirty: false,
        }
    }

    /// The point's definition.
    pub fn point_type(&self) -> &PointType {
        &self.point_type
    }

    /// The point id from the definition.
    pub fn id(&self) -> &str {
        &self.point_type.id
    }

    /// Absolute register address.
    pub fn addr(&self) -> u16 {
        self.addr
    }

    /// The resolved scale-factor binding, if the definition declares one.
    pub fn scale_factor(&self) -> Option<&ScaleFactor> {
        self.sf.as_ref()
    }

    /// The raw on-wire value, before scale-factor cooking. `None` when unimplemented.
    pub fn value_base(&self) -> Option<&Value> {
        self.value_base.as_ref()
    }

    /// Replace the raw value without touching the dirty flag.
    pub fn set_value_base(&mut self, value: Option<Value>) {
        self.implemented = value.is_some();
        self.value_base = value;
    }

    /// The scale-factor exponent bound at the last decode.
    pub fn value_sf(&self) -> Option<i16> {
        self.value_sf
    }

    /// Bind the scale-factor exponent. `None` clears it.
    pub fn set_value_sf(&mut self, value_sf: Option<i16>) {
        self.value_sf = value_sf;
    }

    /// Whether the device implements this point.
    pub fn is_implemented(&self) -> bool {
        self.implemented
    }

    /// Whether the point has been written through [`set_value`](Self::set_value) and not yet
    /// flushed to the device.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// The cooked value: `value_base × 10^value_sf` when a nonzero scale factor is bound, else
    /// the raw value.
    pub fn value(&self) -> Option<Value> {
        let base = self.value_base.as_ref()?;

        match self.value_sf {
            Some(sf) if sf != 0 => {
                let base = base.as_f64()?;

                Some(Value::Float(base * 10f64.powi(sf.into())))
            }
            _ => Some(base.clone()),
        }
    }

    /// Assign a value and mark the point dirty.
    ///
    /// With a nonzero scale factor bound, the input is rounded to `|value_sf|` decimal places and
    /// divided by `10^value_sf` before being stored as the raw integer. Without one the input is
    /// coerced through the type's value space, so `"42"` is accepted for an `int16` point.
    pub fn set_value(&mut self, value: impl Into<Value>) -> Result<(), Error> {
        let value = value.into();

        let stored = match self.value_sf {
            Some(sf) if sf != 0 => {
                let raw = match &value {
                    Value::String(s) => s.trim().parse::<f64>().map_err(|_| WireError::Parse)?,
                    other => other.as_f64().ok_or(WireError::ValueKind)?,
                };

                let decimals = u32::from(sf.unsigned_abs());
                let rounded = round_decimals(raw, decimals);
                let base = (rounded / 10f64.powi(sf.into())).round() as i64;

                integer_value(self.point_type.kind, base)?
            }
            _ => coerce(self.point_type.kind, value)?,
        };

        self.implemented = true;
        self.value_base = Some(stored);
        self.dirty = true;

        Ok(())
    }

    /// Deep comparison. Returns a diagnostic string on the first mismatch, `None` on equality.
    pub fn diff(&self, other: &Point) -> Option<String> {
        if let Some(diff) = self.point_type.diff(&other.point_type) {
            return Some(format!("point {} not equal - {}", self.id(), diff));
        }

        if self.value_base != other.value_base || self.value_sf != other.value_sf {
            return Some(format!(
                "point {} not equal: {:?} {:?} - {:?} {:?}",
                self.id(),
                self.value_base,
                self.value_sf,
                other.value_base,
                other.value_sf
            ));
        }

        None
    }
}

fn round_decimals(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);

    (value * factor).round() / factor
}

/// Store an integer in the value variant the point type decodes to.
fn integer_value(kind: PointKind, value: i64) -> Result<Value, WireError> {
    match kind {
        PointKind::Int16
        | PointKind::Int32
        | PointKind::Int64
        | PointKind::Sunssf
        | PointKind::Pad => Ok(Value::Integer(value)),
        PointKind::Uint16
        | PointKind::Count
        | PointKind::Acc16
        | PointKind::Enum16
        | PointKind::Bitfield16
        | PointKind::Uint32
        | PointKind::Acc32
        | PointKind::Enum32
        | PointKind::Bitfield32
        | PointKind::Ipaddr
        | PointKind::Uint64
        | PointKind::Acc64 => u64::try_from(value)
            .map(Value::Unsigned)
            .map_err(|_| WireError::OutOfRange),
        PointKind::Float32 => Ok(Value::Float(value as f64)),
        PointKind::String | PointKind::Ipv6addr | PointKind::Eui48 => Err(WireError::ValueKind),
    }
}

/// Coerce an assigned value into the variant the point type decodes to.
fn coerce(kind: PointKind, value: Value) -> Result<Value, WireError> {
    match (&value, kind) {
        (Value::String(s), kind)
            if !matches!(
                kind,
                PointKind::String | PointKind::Ipv6addr | PointKind::Eui48
            ) =>
        {
            sunspec_wire::value_from_str(kind, s)
        }
        (_, PointKind::Float32) => value
            .as_f64()
            .map(Value::Float)
            .ok_or(WireError::ValueKind),
        (Value::Integer(_) | Value::Unsigned(_), _) => {
            integer_value(kind, value.as_i64().ok_or(WireError::OutOfRange)?)
        }
        (Value::String(_), _) => Ok(value),
        (Value::Float(_), _) => Err(WireError::ValueKind),
    }
}

/// One block instance: the fixed block at index 0, repeating instances at index ≥ 1.
#[derive(Debug, Clone)]
pub struct Block {
    block_type: Arc<BlockType>,
    addr: u16,
    len: u16,
    index: usize,
    points: Vec<Point>,
    points_sf: Vec<Point>,
}

impl Block {
    fn instantiate(block_type: Arc<BlockType>, addr: u16, len: u16, index: usize) -> Self {
        let mut points = Vec::new();
        let mut points_sf = Vec::new();

        for point_type in &block_type.points {
            if point_type.kind.is_pad() {
                continue;
            }

            let point = Point::new(Arc::clone(point_type), addr + point_type.offset);

            if point_type.kind.is_scale_factor() {
                points_sf.push(point);
            } else {
                points.push(point);
            }
        }

        Self {
            block_type,
            addr,
            len,
            index,
            points,
            points_sf,
        }
    }

    /// The block's definition.
    pub fn block_type(&self) -> &BlockType {
        &self.block_type
    }

    /// Absolute register address of the block.
    pub fn addr(&self) -> u16 {
        self.addr
    }

    /// Register length of this instance.
    pub fn len(&self) -> u16 {
        self.len
    }

    /// Instance index: 0 for the fixed block, 1.. for repeating instances.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Non-scale-factor points in offset order.
    pub fn points(&self) -> &[Point] {
        &self.points
    }

    /// Non-scale-factor points, mutable.
    pub fn points_mut(&mut self) -> &mut [Point] {
        &mut self.points
    }

    /// Scale-factor points in offset order.
    pub fn points_sf(&self) -> &[Point] {
        &self.points_sf
    }

    pub(crate) fn points_sf_mut(&mut self) -> &mut [Point] {
        &mut self.points_sf
    }

    /// Look up a non-scale-factor point by id.
    pub fn point(&self, id: &str) -> Option<&Point> {
        self.points.iter().find(|p| p.id() == id)
    }

    /// Look up a non-scale-factor point by id, mutable.
    pub fn point_mut(&mut self, id: &str) -> Option<&mut Point> {
        self.points.iter_mut().find(|p| p.id() == id)
    }

    /// Look up a scale-factor point by id.
    pub fn sf_point(&self, id: &str) -> Option<&Point> {
        self.points_sf.iter().find(|p| p.id() == id)
    }

    /// Look up a scale-factor point by id, mutable.
    pub fn sf_point_mut(&mut self, id: &str) -> Option<&mut Point> {
        self.points_sf.iter_mut().find(|p| p.id() == id)
    }

    pub(crate) fn any_point_mut(&mut self, id: &str) -> Option<&mut Point> {
        if self.points.iter().any(|p| p.id() == id) {
            return self.point_mut(id);
        }

        self.sf_point_mut(id)
    }

    /// All point extents `(addr, len)` in address order, scale factors included.
    pub(crate) fn point_extents(&self) -> Vec<(u16, u16)> {
        let mut extents: Vec<(u16, u16)> = self
            .points
            .iter()
            .chain(self.points_sf.iter())
            .map(|p| (p.addr, p.point_type.len))
            .collect();

        extents.sort_unstable();

        extents
    }

    /// Deep comparison. Returns a diagnostic string on the first mismatch, `None` on equality.
    pub fn diff(&self, other: &Block) -> Option<String> {
        if let Some(diff) = self.block_type.diff(&other.block_type) {
            return Some(format!(
                "block {} not equal - block type not equal: {}",
                self.index, diff
            ));
        }

        for point in &self.points {
            let Some(other_point) = other.point(point.id()) else {
                return Some(format!(
                    "block {} not equal - point {} missing",
                    self.index,
                    point.id()
                ));
            };

            if let Some(diff) = point.diff(other_point) {
                return Some(format!("block {} not equal - {}", self.index, diff));
            }
        }

        None
    }
}

/// One model instance discovered on (or snapshotted from) a device.
#[derive(Debug, Clone)]
pub struct Model {
    id: u16,
    index: usize,
    addr: u16,
    len: u16,
    model_type: Option<Arc<ModelType>>,
    blocks: Vec<Block>,
    read_blocks: Vec<u16>,
    load_error: Option<String>,
}

impl Model {
    /// Create an unloaded model. `addr` is the address of the first payload register (past the
    /// id and length registers); a `len` of 0 is replaced by the definition length at load time.
    pub fn new(id: u16, addr: u16, len: u16) -> Self {
        Self {
            id,
            index: 1,
            addr,
            len,
            model_type: None,
            blocks: Vec::new(),
            read_blocks: Vec::new(),
            load_error: None,
        }
    }

    /// Model id.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// 1-based instance index among models with the same id.
    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn set_index(&mut self, index: usize) {
        self.index = index;
    }

    /// Address of the first payload register.
    pub fn addr(&self) -> u16 {
        self.addr
    }

    /// Register length of the model payload.
    pub fn len(&self) -> u16 {
        self.len
    }

    /// The loaded definition, if [`load`](Self::load) succeeded.
    pub fn model_type(&self) -> Option<&Arc<ModelType>> {
        self.model_type.as_ref()
    }

    /// The model name from its definition, or `model_<id>` when the definition failed to load.
    pub fn name(&self) -> String {
        match &self.model_type {
            Some(model_type) => model_type.name.clone(),
            None => format!("model_{}", self.id),
        }
    }

    /// Block instances: the fixed block first, repeating instances after it.
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Block instances, mutable.
    pub fn blocks_mut(&mut self) -> &mut [Block] {
        &mut self.blocks
    }

    /// Pre-computed read partition start addresses.
    pub fn read_blocks(&self) -> &[u16] {
        &self.read_blocks
    }

    /// The error captured when a scan failed to load this model's definition.
    pub fn load_error(&self) -> Option<&str> {
        self.load_error.as_deref()
    }

    pub(crate) fn set_load_error(&mut self, error: &Error) {
        self.load_error = Some(error.to_string());
    }

    /// Fixed-block point lookup by id. Scale-factor and pad points are not exposed here.
    pub fn point(&self, id: &str) -> Option<&Point> {
        self.blocks.first()?.point(id)
    }

    /// Fixed-block point lookup by id, mutable.
    pub fn point_mut(&mut self, id: &str) -> Option<&mut Point> {
        self.blocks.first_mut()?.point_mut(id)
    }

    /// Instantiate blocks and points from the model definition in `registry`.
    ///
    /// Emits the fixed block at the model's start address, then as many repeating-block
    /// instances as the model's declared extent holds. Scale-factor references are resolved and
    /// the ≤125-register read partitions are computed.
    pub fn load(&mut self, registry: &ModelRegistry) -> Result<(), Error> {
        let model_type = registry.get(self.id)?;

        if self.len == 0 {
            self.len = model_type.len;
        }

        let end_addr = u32::from(self.addr) + u32::from(self.len);

        let mut blocks: Vec<Block> = Vec::new();
        let mut block_type = Arc::clone(&model_type.fixed_block);
        let mut block_addr = self.addr;
        let mut block_len = block_type.len;
        let mut index = 0usize;

        // Older devices advertise the common model with 65 registers instead of 66
        if self.id == 1 && self.len == 65 {
            block_len = 65;
        }

        while u32::from(block_addr) + u32::from(block_len) <= end_addr {
            blocks.push(Block::instantiate(
                Arc::clone(&block_type),
                block_addr,
                block_len,
                index,
            ));

            resolve_scale_factors(&mut blocks, index, self.id)?;

            block_addr += block_len;

            match &model_type.repeating_block {
                Some(repeating) if repeating.len > 0 => {
                    block_type = Arc::clone(repeating);
                    block_len = repeating.len;
                    index += 1;
                }
                _ => break,
            }
        }

        self.model_type = Some(model_type);
        self.blocks = blocks;
        self.read_blocks = compute_read_blocks(self.addr, &self.blocks);
        self.load_error = None;

        Ok(())
    }

    /// Deep comparison. Returns a diagnostic string on the first mismatch, `None` on equality.
    pub fn diff(&self, other: &Model) -> Option<String> {
        if self.blocks.len() != other.blocks.len() {
            return Some(format!(
                "model {} not equal - block counts: {} {}",
                self.id,
                self.blocks.len(),
                other.blocks.len()
            ));
        }

        match (&self.model_type, &other.model_type) {
            (Some(a), Some(b)) => {
                if let Some(diff) = a.diff(b) {
                    return Some(format!("model {} not equal - {}", self.id, diff));
                }
            }
            (None, None) => {}
            _ => return Some(format!("model {} not equal - definition missing", self.id)),
        }

        for (a, b) in self.blocks.iter().zip(other.blocks.iter()) {
            if let Some(diff) = a.diff(b) {
                return Some(format!("model {} not equal - {}", self.id, diff));
            }
        }

        None
    }
}

/// Resolve the scale-factor reference of every point in `blocks[index]`.
///
/// A reference is, in order of preference: an integer literal, a `sunssf` point in the same
/// block, or — for repeating blocks only — a `sunssf` point in the fixed block.
fn resolve_scale_factors(blocks: &mut [Block], index: usize, model_id: u16) -> Result<(), Error> {
    let own_sf: Vec<String> = blocks[index]
        .points_sf
        .iter()
        .map(|p| p.id().to_string())
        .collect();

    let fixed_sf: Vec<String> = if index > 0 {
        blocks[0]
            .points_sf
            .iter()
            .map(|p| p.id().to_string())
            .collect()
    } else {
        Vec::new()
    };

    for point in &mut blocks[index].points {
        let Some(sf_ref) = point.point_type.sf.clone() else {
            continue;
        };

        let resolved = if let Ok(constant) = sf_ref.parse::<i16>() {
            ScaleFactor::Constant(constant)
        } else if own_sf.iter().any(|id| *id == sf_ref) {
            ScaleFactor::Point {
                block: index,
                id: sf_ref.clone(),
            }
        } else if fixed_sf.iter().any(|id| *id == sf_ref) {
            ScaleFactor::Point {
                block: 0,
                id: sf_ref.clone(),
            }
        } else {
            return Err(Error::Resolution {
                point: point.id().to_string(),
                sf: sf_ref,
                model: model_id,
            });
        };

        point.sf = Some(resolved);
    }

    Ok(())
}

/// Partition the model's register range so no read window spans more than
/// [`REQ_COUNT_MAX`] registers: whenever the next point would extend the current window past the
/// limit, a new window opens at that point's address.
fn compute_read_blocks(model_addr: u16, blocks: &[Block]) -> Vec<u16> {
    if blocks.is_empty() {
        return Vec::new();
    }

    let mut read_blocks = vec![model_addr];
    let mut window_start = model_addr;

    for block in blocks {
        for (addr, len) in block.point_extents() {
            if addr + len - window_start > REQ_COUNT_MAX {
                read_blocks.push(addr);
                window_start = addr;
            }
        }
    }

    read_blocks
}

/// A SunSpec device: a base address and an ordered list of models.
#[derive(Debug, Clone, Default)]
pub struct Device {
    base_addr: Option<u16>,
    models: Vec<Model>,
}

impl Device {
    /// Create a device with no models. `base_addr` of `None` means "not yet discovered".
    pub fn new(base_addr: Option<u16>) -> Self {
        Self {
            base_addr,
            models: Vec::new(),
        }
    }

    /// The SunSpec base address.
    pub fn base_addr(&self) -> Option<u16> {
        self.base_addr
    }

    /// Set the base address, normally from discovery or a snapshot.
    pub fn set_base_addr(&mut self, base_addr: u16) {
        self.base_addr = Some(base_addr);
    }

    /// Append a model in chain order and assign its instance index.
    pub fn add_model(&mut self, mut model: Model) {
        let instances = self.models.iter().filter(|m| m.id() == model.id()).count();

        model.set_index(instances + 1);
        self.models.push(model);
    }

    /// Models in chain order.
    pub fn models(&self) -> &[Model] {
        &self.models
    }

    /// Models in chain order, mutable.
    pub fn models_mut(&mut self) -> &mut [Model] {
        &mut self.models
    }

    /// All instances of a model id, in chain order.
    pub fn models_by_id(&self, id: u16) -> Vec<&Model> {
        self.models.iter().filter(|m| m.id() == id).collect()
    }

    /// The first instance of a model id.
    pub fn model_by_id(&self, id: u16) -> Option<&Model> {
        self.models.iter().find(|m| m.id() == id)
    }

    /// The first instance of a model id, mutable.
    pub fn model_by_id_mut(&mut self, id: u16) -> Option<&mut Model> {
        self.models.iter_mut().find(|m| m.id() == id)
    }

    /// Deep comparison. Returns a diagnostic string on the first mismatch, `None` on equality.
    ///
    /// This is the equivalence used throughout the test suite to check that scanning a live map
    /// and loading a snapshot produce identical trees.
    pub fn diff(&self, other: &Device) -> Option<String> {
        if self.models.len() != other.models.len() {
            return Some(format!(
                "devices not equal - model counts: {} {}",
                self.models.len(),
                other.models.len()
            ));
        }

        for (a, b) in self.models.iter().zip(other.models.iter()) {
            if let Some(diff) = a.diff(b) {
                return Some(format!("devices not equal - {}", diff));
            }
        }

        None
    }
}
