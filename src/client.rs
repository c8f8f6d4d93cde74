//! Device scanner and typed client facade.
//!
//! [`ClientDevice`] ties a transport to a [`Device`] tree: [`scan`](ClientDevice::scan) probes
//! the SunSpec base address and walks the model chain, and
//! [`read_points`](ClientDevice::read_points)/[`write_named`](ClientDevice::write_named) move
//! point values between the tree and the device's registers.
//!
//! Models are exposed as plain records looked up by definition name or id; point access is by
//! id through [`Model::point`]. Scale-factor and pad points are not part of that surface.

use crate::device::{Device, Model, ScaleFactor};
use crate::error::{Error, ProtocolError};
use crate::io::Parity;
use crate::modbus::mbmap::MappedTransport;
use crate::modbus::rtu::{RtuRegistry, RtuTransport};
use crate::modbus::tcp::TcpTransport;
use crate::modbus::{FunctionCode, ModbusTransport};
use crate::pathlist::PathList;
use crate::smdx::ModelRegistry;
use crate::{BASE_ADDR_CANDIDATES, END_MODEL_ID, SUNS_SIGNATURE};
use std::sync::Arc;
use std::time::Duration;

/// A progress callback invoked before each model during a scan. Returning `false` cancels the
/// scan with [`Error::ScanAborted`].
pub type ScanProgress<'a> = &'a mut dyn FnMut(&str) -> bool;

/// A SunSpec device bound to a Modbus transport.
pub struct ClientDevice {
    device: Device,
    transport: Box<dyn ModbusTransport>,
    registry: Arc<ModelRegistry>,
}

impl ClientDevice {
    /// Open a device over Modbus RTU, sharing the port through the global registry.
    pub fn rtu(
        slave_id: u8,
        port_name: &str,
        baudrate: Option<u32>,
        parity: Option<Parity>,
        timeout: Option<Duration>,
    ) -> Result<Self, Error> {
        let transport = RtuTransport::new(
            slave_id,
            port_name,
            baudrate,
            parity,
            timeout,
            RtuRegistry::global(),
        )?;

        Ok(Self::with_transport(
            Box::new(transport),
            ModelRegistry::global(),
        ))
    }

    /// Open a device over Modbus TCP.
    pub fn tcp(
        slave_id: u8,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
    ) -> Result<Self, Error> {
        let transport = TcpTransport::new(slave_id, host, port, timeout);

        Ok(Self::with_transport(
            Box::new(transport),
            ModelRegistry::global(),
        ))
    }

    /// Open a simulated device backed by an mbmap register map file.
    pub fn mapped(map_file: &str, pathlist: Option<&PathList>) -> Result<Self, Error> {
        let transport = MappedTransport::new(map_file, pathlist)?;

        Ok(Self::with_transport(
            Box::new(transport),
            ModelRegistry::global(),
        ))
    }

    /// Bind an arbitrary transport and model registry. This is the seam the test suite uses.
    pub fn with_transport(
        transport: Box<dyn ModbusTransport>,
        registry: Arc<ModelRegistry>,
    ) -> Self {
        Self {
            device: Device::new(None),
            transport,
            registry,
        }
    }

    /// The device tree.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The device tree, mutable.
    pub fn device_mut(&mut self) -> &mut Device {
        &mut self.device
    }

    /// Replace the device tree, e.g. with one loaded from a snapshot.
    pub fn set_device(&mut self, device: Device) {
        self.device = device;
    }

    /// The first model whose definition name matches.
    pub fn model(&self, name: &str) -> Option<&Model> {
        self.device.models().iter().find(|m| m.name() == name)
    }

    /// The first model whose definition name matches, mutable.
    pub fn model_mut(&mut self, name: &str) -> Option<&mut Model> {
        self.device
            .models_mut()
            .iter_mut()
            .find(|m| m.name() == name)
    }

    /// All models with a definition name, in discovery order.
    pub fn models_named(&self, name: &str) -> Vec<&Model> {
        self.device
            .models()
            .iter()
            .filter(|m| m.name() == name)
            .collect()
    }

    /// Read raw registers from the device.
    pub fn read(&mut self, addr: u16, count: u16) -> Result<Vec<u8>, Error> {
        self.transport.read(addr, count, FunctionCode::ReadHolding)
    }

    /// Write raw register bytes to the device.
    pub fn write(&mut self, addr: u16, data: &[u8]) -> Result<(), Error> {
        self.transport.write(addr, data)
    }

    /// Discover the SunSpec base address and walk the model chain.
    pub fn scan(&mut self) -> Result<(), Error> {
        self.scan_with(None, None)
    }

    /// [`scan`](Self::scan) with a progress callback and an optional inter-read delay to pace
    /// fragile devices.
    pub fn scan_with(
        &mut self,
        mut progress: Option<ScanProgress<'_>>,
        delay: Option<Duration>,
    ) -> Result<(), Error> {
        // Wrap the scan's burst of reads in one session where the transport supports it
        self.transport.connect()?;

        let result = self.scan_inner(&mut progress, delay);

        self.transport.disconnect();

        result
    }

    fn scan_inner(
        &mut self,
        progress: &mut Option<ScanProgress<'_>>,
        delay: Option<Duration>,
    ) -> Result<(), Error> {
        let mut first_model_id = None;

        if self.device.base_addr().is_none() {
            let mut first_error: Option<Error> = None;

            for candidate in BASE_ADDR_CANDIDATES {
                match self.transport.read(candidate, 3, FunctionCode::ReadHolding) {
                    Ok(data) if data.len() >= 6 && data[..4] == SUNS_SIGNATURE => {
                        self.device.set_base_addr(candidate);
                        first_model_id = Some(u16::from_be_bytes([data[4], data[5]]));

                        log::debug!("found SunS signature at base address {}", candidate);

                        break;
                    }
                    Ok(_) => {
                        first_error.get_or_insert(ProtocolError::Signature.into());
                    }
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }

                sleep(delay);
            }

            if self.device.base_addr().is_none() {
                return Err(first_error.unwrap_or(ProtocolError::Signature.into()));
            }
        }

        let base_addr = self.device.base_addr().unwrap_or_default();

        let mut model_id = match first_model_id {
            Some(id) => id,
            None => {
                let data = self
                    .transport
                    .read(base_addr + 2, 1, FunctionCode::ReadHolding)?;

                u16::from_be_bytes([data[0], data[1]])
            }
        };

        let mut addr = base_addr + 2;

        while model_id != END_MODEL_ID {
            if let Some(progress) = progress.as_mut() {
                if !progress(&format!("Scanning model {}", model_id)) {
                    return Err(Error::ScanAborted);
                }
            }

            // The id and length registers are read separately: some devices omit the length
            // register after the end-of-chain id
            let data = self.transport.read(addr + 1, 1, FunctionCode::ReadHolding)?;

            if data.len() != 2 {
                break;
            }

            let model_len = u16::from_be_bytes([data[0], data[1]]);

            log::debug!("model {} at {}, {} registers", model_id, addr + 2, model_len);

            let mut model = Model::new(model_id, addr + 2, model_len);

            if let Err(e) = model.load(&self.registry) {
                log::warn!("model {} failed to load: {}", model_id, e);

                model.set_load_error(&e);
            }

            self.device.add_model(model);

            addr += model_len + 2;

            let data = self.transport.read(addr, 1, FunctionCode::ReadHolding)?;

            if data.len() != 2 {
                break;
            }

            model_id = u16::from_be_bytes([data[0], data[1]]);

            sleep(delay);
        }

        log::debug!("scan complete: {} models", self.device.models().len());

        Ok(())
    }

    /// Read every model's points from the device.
    pub fn read_points(&mut self) -> Result<(), Error> {
        for index in 0..self.device.models().len() {
            self.read_model_at(index)?;
        }

        Ok(())
    }

    /// Read the points of the model at `index` in chain order.
    ///
    /// One transport read is issued per pre-computed partition; the responses are concatenated
    /// and decoded with scale-factor points first so regular points can bind their exponents.
    pub fn read_model_at(&mut self, index: usize) -> Result<(), Error> {
        let Some(model) = self.device.models().get(index) else {
            return Err(Error::NotFound(format!("model index {}", index)));
        };

        if model.model_type().is_none() {
            return Ok(());
        }

        let addr = model.addr();
        let len = model.len();
        let partitions = model.read_blocks().to_vec();

        let data = if partitions.len() <= 1 {
            self.transport.read(addr, len, FunctionCode::ReadHolding)?
        } else {
            let mut data = Vec::with_capacity(usize::from(len) * 2);

            for (i, start) in partitions.iter().enumerate() {
                let end = partitions.get(i + 1).copied().unwrap_or(addr + len);

                data.extend_from_slice(&self.transport.read(
                    *start,
                    end - start,
                    FunctionCode::ReadHolding,
                )?);
            }

            data
        };

        decode_model(&mut self.device.models_mut()[index], &data)
    }

    /// Read the points of the first model named `name`.
    pub fn read_named(&mut self, name: &str) -> Result<(), Error> {
        let index = self.named_index(name)?;

        self.read_model_at(index)
    }

    /// Flush every dirty point of the model at `index`.
    ///
    /// Runs of dirty points at physically contiguous addresses coalesce into one multi-register
    /// write; a run is flushed when an address gap is found or at the end of a block. The dirty
    /// flag clears only after its run's write succeeds.
    pub fn write_model_at(&mut self, index: usize) -> Result<(), Error> {
        let Some(model) = self.device.models().get(index) else {
            return Err(Error::NotFound(format!("model index {}", index)));
        };

        let block_count = model.blocks().len();

        for block_index in 0..block_count {
            let runs = collect_dirty_runs(&self.device.models()[index], block_index)?;

            for run in runs {
                self.transport.write(run.addr, &run.data)?;

                let block = &mut self.device.models_mut()[index].blocks_mut()[block_index];

                for point_index in run.points {
                    block.points_mut()[point_index].clear_dirty();
                }
            }
        }

        Ok(())
    }

    /// Flush every dirty point of the first model named `name`.
    pub fn write_named(&mut self, name: &str) -> Result<(), Error> {
        let index = self.named_index(name)?;

        self.write_model_at(index)
    }

    fn named_index(&self, name: &str) -> Result<usize, Error> {
        self.device
            .models()
            .iter()
            .position(|m| m.name() == name)
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Release the transport.
    pub fn close(&mut self) {
        self.transport.close();
    }
}

impl Drop for ClientDevice {
    fn drop(&mut self) {
        self.close();
    }
}

fn sleep(delay: Option<Duration>) {
    if let Some(delay) = delay {
        std::thread::sleep(delay);
    }
}

/// Decode a full model's register image into its points.
fn decode_model(model: &mut Model, data: &[u8]) -> Result<(), Error> {
    let model_addr = model.addr();

    if data.len() != usize::from(model.len()) * 2 {
        return Err(ProtocolError::Truncated.into());
    }

    // Scale-factor points first so their bases are in place before binding
    for block in model.blocks_mut() {
        for point in block.points_sf_mut() {
            let point_type = point.point_type();
            let kind = point_type.kind;
            let len = point_type.len;
            let start = usize::from(point.addr() - model_addr) * 2;
            let end = start + usize::from(len) * 2;

            let value = sunspec_wire::decode(kind, &data[start..end], len)?;

            point.set_value_base(value);
        }
    }

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
            let point_type = point.point_type();
            let kind = point_type.kind;
            let len = point_type.len;
            let start = usize::from(point.addr() - model_addr) * 2;
            let end = start + usize::from(len) * 2;

            match sunspec_wire::decode(kind, &data[start..end], len)? {
                Some(value) => {
                    let sf = match point.scale_factor() {
                        None => None,
                        Some(ScaleFactor::Constant(constant)) => Some(*constant),
                        Some(ScaleFactor::Point { block, id }) => sf_values[*block]
                            .iter()
                            .find(|(sf_id, _)| sf_id == id)
                            .and_then(|(_, value)| *value),
                    };

                    point.set_value_base(Some(value));
                    point.set_value_sf(sf);
                }
                None => {
                    point.set_value_base(None);
                    point.set_value_sf(None);
                }
            }
        }
    }

    Ok(())
}

struct DirtyRun {
    addr: u16,
    data: Vec<u8>,
    points: Vec<usize>,
}

fn collect_dirty_runs(model: &Model, block_index: usize) -> Result<Vec<DirtyRun>, Error> {
    let block = &model.blocks()[block_index];
    let mut runs: Vec<DirtyRun> = Vec::new();

    for (point_index, point) in block.points().iter().enumerate() {
        if !point.is_dirty() {
            continue;
        }

        let point_type = point.point_type();

        let bytes = match point.value_base() {
            Some(value) => sunspec_wire::encode(point_type.kind, value, point_type.len)?,
            // An unimplemented point flushes its sentinel so it round-trips unchanged
            None => sunspec_wire::sentinel(point_type.kind, point_type.len),
        };

        match runs.last_mut() {
            Some(run) if run.addr + (run.data.len() / 2) as u16 == point.addr() => {
                run.data.extend_from_slice(&bytes);
                run.points.push(point_index);
            }
            _ => runs.push(DirtyRun {
                addr: point.addr(),
                data: bytes,
                points: vec![point_index],
            }),
        }
    }

    Ok(runs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::mbmap::ModbusMap;
    use crate::smdx::ModelType;
    use sunspec_wire::Value;

    const SMDX: &str = r#"
<sunSpecModels v="1">
  <model id="63030" len="4" name="scan_test">
    <block len="4">
      <point id="SF" offset="0" type="sunssf" />
      <point id="A" offset="1" type="int16" sf="SF" access="rw" />
      <point id="B" offset="2" type="uint16" access="rw" />
      <point id="C" offset="3" type="uint16" access="rw" />
    </block>
  </model>
</sunSpecModels>
"#;

    const MAP: &str = r#"
<mbmap addr="40000" func="holding">
  <regs offset="0" type="string" len="2">SunS</regs>
  <regs offset="2" type="u16">63030</regs>
  <regs offset="3" type="u16">4</regs>
  <regs offset="4" type="s16">1</regs>
  <regs offset="5" type="s16">-2</regs>
  <regs offset="6" type="u16">7</regs>
  <regs offset="7" type="u16">8</regs>
  <regs offset="8" type="u16">0xffff</regs>
</mbmap>
"#;

    fn registry() -> Arc<ModelRegistry> {
        let registry = ModelRegistry::new(PathList::new());

        registry.insert(ModelType::from_smdx_str(SMDX).unwrap());

        Arc::new(registry)
    }

    fn mapped_client(map: &str) -> ClientDevice {
        let transport = MappedTransport::from_map(ModbusMap::from_xml_str(map).unwrap());

        ClientDevice::with_transport(Box::new(transport), registry())
    }

    #[test]
    fn scan_probes_base_and_walks_chain() {
        let mut client = mapped_client(MAP);

        client.scan().unwrap();

        assert_eq!(client.device().base_addr(), Some(40000));
        assert_eq!(client.device().models().len(), 1);

        let model = &client.device().models()[0];

        assert_eq!(model.id(), 63030);
        assert_eq!(model.addr(), 40004);
        assert_eq!(model.len(), 4);
        assert!(model.load_error().is_none());
    }

    #[test]
    fn read_binds_scale_factors() {
        let mut client = mapped_client(MAP);

        client.scan().unwrap();
        client.read_points().unwrap();

        let model = client.model("scan_test").unwrap();
        let point = model.point("A").unwrap();

        assert_eq!(point.value_base(), Some(&Value::Integer(-2)));
        assert_eq!(point.value_sf(), Some(1));
        assert_eq!(point.value(), Some(Value::Float(-20.0)));
    }

    #[test]
    fn write_roundtrip_through_map() {
        let mut client = mapped_client(MAP);

        client.scan().unwrap();
        client.read_points().unwrap();

        client
            .model_mut("scan_test")
            .unwrap()
            .point_mut("A")
            .unwrap()
            .set_value(330.0)
            .unwrap();

        client.write_named("scan_test").unwrap();
        client.read_named("scan_test").unwrap();

        let point = client.model("scan_test").unwrap().point("A").unwrap();

        assert_eq!(point.value_base(), Some(&Value::Integer(33)));
        assert_eq!(point.value(), Some(Value::Float(330.0)));
        assert!(!point.is_dirty());
    }

    #[test]
    fn unknown_model_definition_is_captured_not_fatal() {
        let map = r#"
<mbmap addr="40000" func="holding">
  <regs offset="0" type="string" len="2">SunS</regs>
  <regs offset="2" type="u16">64999</regs>
  <regs offset="3" type="u16">1</regs>
  <regs offset="4" type="u16">0</regs>
  <regs offset="5" type="u16">63030</regs>
  <regs offset="6" type="u16">4</regs>
  <regs offset="7" type="s16">0</regs>
  <regs offset="8" type="s16">5</regs>
  <regs offset="9" type="u16">6</regs>
  <regs offset="10" type="u16">7</regs>
  <regs offset="11" type="u16">0xffff</regs>
</mbmap>
"#;

        let mut client = mapped_client(map);

        client.scan().unwrap();

        let models = client.device().models();

        assert_eq!(models.len(), 2);
        assert!(models[0].load_error().is_some());
        assert!(models[1].load_error().is_none());
        assert_eq!(models[1].id(), 63030);
    }

    #[test]
    fn progress_callback_cancels_scan() {
        let mut client = mapped_client(MAP);
        let mut progress = |_status: &str| false;

        let result = client.scan_with(Some(&mut progress), None);

        assert!(matches!(result, Err(Error::ScanAborted)));
    }

    #[test]
    fn no_signature_reports_first_error() {
        let map = r#"
<mbmap addr="40000" func="holding">
  <regs offset="0" type="string" len="2">XXXX</regs>
  <regs offset="2" type="u16">1</regs>
</mbmap>
"#;

        let mut client = mapped_client(map);

        let result = client.scan();

        assert!(result.is_err());
    }
}
