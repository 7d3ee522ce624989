// ADMA PCIe DMA Engine Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Device attach and handle open.
//!
//! A [`Device`] is built from resources that enumeration already produced:
//! mapped BAR windows, one descriptor per engine, and the number of user
//! event sources. Attach creates the engines, binds their completion
//! interrupts, starts one serial queue per enabled engine and creates the
//! event slots. Handles are opened by node name (`h2c_0`, `user`,
//! `event_3`, ...) through a fixed name table.

use crate::config::DeviceConfig;
use crate::descriptor::{DescriptorProgrammer, SgProgrammer};
use crate::dispatch::{FileHandle, NodeBinding};
use crate::engine::{CompletionMode, Direction, Engine, EngineDescriptor, TransferMode};
use crate::error::{AdmaError, AdmaResult};
use crate::event::EventSlot;
use crate::loopback::LoopbackEngine;
use crate::queue::EngineQueue;
use crate::transaction::Terminal;
use crate::window::{MemoryWindow, RegisterWindow};
use std::collections::HashMap;
use std::sync::Arc;

/// Engines per direction.
pub const MAX_CHANNELS: u32 = 4;

/// User event sources.
pub const MAX_USER_EVENTS: u32 = 16;

/// Device node classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    H2C,
    C2H,
    AdvancedH2C,
    AdvancedC2H,
    User,
    Control,
    Bypass,
    Event,
}

impl NodeType {
    /// Transfer direction for DMA nodes.
    pub const fn direction(self) -> Option<Direction> {
        match self {
            Self::H2C | Self::AdvancedH2C => Some(Direction::H2C),
            Self::C2H | Self::AdvancedC2H => Some(Direction::C2H),
            _ => None,
        }
    }

    pub const fn is_window(self) -> bool {
        matches!(self, Self::User | Self::Control | Self::Bypass)
    }
}

/// Node name to (type, channel or event index).
static NODE_TABLE: [(&str, NodeType, u32); 35] = [
    ("control", NodeType::Control, 0),
    ("user", NodeType::User, 0),
    ("bypass", NodeType::Bypass, 0),
    ("h2c_0", NodeType::H2C, 0),
    ("h2c_1", NodeType::H2C, 1),
    ("h2c_2", NodeType::H2C, 2),
    ("h2c_3", NodeType::H2C, 3),
    ("c2h_0", NodeType::C2H, 0),
    ("c2h_1", NodeType::C2H, 1),
    ("c2h_2", NodeType::C2H, 2),
    ("c2h_3", NodeType::C2H, 3),
    ("ah2c_0", NodeType::AdvancedH2C, 0),
    ("ah2c_1", NodeType::AdvancedH2C, 1),
    ("ah2c_2", NodeType::AdvancedH2C, 2),
    ("ah2c_3", NodeType::AdvancedH2C, 3),
    ("ac2h_0", NodeType::AdvancedC2H, 0),
    ("ac2h_1", NodeType::AdvancedC2H, 1),
    ("ac2h_2", NodeType::AdvancedC2H, 2),
    ("ac2h_3", NodeType::AdvancedC2H, 3),
    ("event_0", NodeType::Event, 0),
    ("event_1", NodeType::Event, 1),
    ("event_2", NodeType::Event, 2),
    ("event_3", NodeType::Event, 3),
    ("event_4", NodeType::Event, 4),
    ("event_5", NodeType::Event, 5),
    ("event_6", NodeType::Event, 6),
    ("event_7", NodeType::Event, 7),
    ("event_8", NodeType::Event, 8),
    ("event_9", NodeType::Event, 9),
    ("event_10", NodeType::Event, 10),
    ("event_11", NodeType::Event, 11),
    ("event_12", NodeType::Event, 12),
    ("event_13", NodeType::Event, 13),
    ("event_14", NodeType::Event, 14),
    ("event_15", NodeType::Event, 15),
];

/// Resolve a node name.
pub fn lookup_node(name: &str) -> Option<(NodeType, u32)> {
    NODE_TABLE
        .iter()
        .find(|(n, _, _)| *n == name)
        .map(|&(_, node, index)| (node, index))
}

/// Everything attach needs from enumeration.
pub struct DeviceResources {
    pub bars: Vec<Arc<dyn RegisterWindow>>,
    /// BAR holding the DMA control registers.
    pub config_bar: usize,
    pub user_bar: Option<usize>,
    pub bypass_bar: Option<usize>,
    pub engines: Vec<EngineDescriptor>,
    pub event_count: u32,
}

struct EngineSlot {
    engine: Arc<Engine>,
    queue: Option<Arc<EngineQueue>>,
}

/// An attached ADMA device.
pub struct Device {
    config: DeviceConfig,
    bars: Vec<Arc<dyn RegisterWindow>>,
    config_bar: usize,
    user_bar: Option<usize>,
    bypass_bar: Option<usize>,
    engines: HashMap<(Direction, u32), EngineSlot>,
    events: Vec<Arc<EventSlot>>,
}

impl Device {
    /// Attach to already-enumerated resources.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` for BAR indices that do not exist, more
    /// than [`MAX_USER_EVENTS`] event sources, channels beyond
    /// [`MAX_CHANNELS`] or two descriptors for the same engine. Returns `Io`
    /// if a queue worker cannot be started.
    pub fn attach(resources: DeviceResources, config: DeviceConfig) -> AdmaResult<Self> {
        let num_bars = resources.bars.len();
        let bar_ok = |bar: Option<usize>| bar.map_or(true, |b| b < num_bars);
        if !bar_ok(Some(resources.config_bar))
            || !bar_ok(resources.user_bar)
            || !bar_ok(resources.bypass_bar)
        {
            log::error!("BAR index out of range ({} BARs)", num_bars);
            return Err(AdmaError::InvalidParameter(format!(
                "BAR index out of range ({} BARs)",
                num_bars
            )));
        }
        if resources.event_count > MAX_USER_EVENTS {
            return Err(AdmaError::InvalidParameter(format!(
                "{} event sources, at most {} supported",
                resources.event_count, MAX_USER_EVENTS
            )));
        }

        let programmer: Arc<dyn DescriptorProgrammer> =
            Arc::new(SgProgrammer::from_config(&config));
        let mut engines = HashMap::new();
        for desc in resources.engines {
            let key = (desc.direction, desc.channel);
            if desc.channel >= MAX_CHANNELS || engines.contains_key(&key) {
                return Err(AdmaError::InvalidParameter(format!(
                    "bad engine {}_{}",
                    desc.direction, desc.channel
                )));
            }
            let hw = desc.hw.clone();
            let engine = Arc::new(Engine::new(desc, programmer.clone(), &config));
            let weak = Arc::downgrade(&engine);
            hw.bind_interrupt(Arc::new(move || {
                if let Some(engine) = weak.upgrade() {
                    engine.on_hardware_completion();
                }
            }));
            let queue = if engine.is_enabled() {
                Some(Arc::new(EngineQueue::spawn(engine.clone())?))
            } else {
                None
            };
            log::info!(
                "{} attached ({:?}, {:?}, enabled={})",
                engine.name(),
                engine.transfer_mode(),
                engine.completion_mode(),
                engine.is_enabled()
            );
            engines.insert(key, EngineSlot { engine, queue });
        }

        let events = (0..resources.event_count)
            .map(|i| Arc::new(EventSlot::new(i)))
            .collect();

        Ok(Self {
            config,
            bars: resources.bars,
            config_bar: resources.config_bar,
            user_bar: resources.user_bar,
            bypass_bar: resources.bypass_bar,
            engines,
            events,
        })
    }

    /// Software device backed by loopback engines.
    ///
    /// Channel 0 is block/interrupt in both directions. Channel 1 has a
    /// polled H2C engine and a streaming C2H engine. BAR 0 is the user
    /// window, BAR 1 the control window and BAR 2 the bypass window, 64 KiB
    /// each. All 16 event sources exist.
    pub fn loopback(config: DeviceConfig) -> AdmaResult<(Self, LoopbackHardware)> {
        let hardware = LoopbackHardware::new(LOOPBACK_MEMORY_SIZE, LOOPBACK_BAR_SIZE);
        let device = Self::attach(hardware.resources(), config)?;
        Ok((device, hardware))
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn engine(&self, direction: Direction, channel: u32) -> Option<Arc<Engine>> {
        self.engines
            .get(&(direction, channel))
            .map(|slot| slot.engine.clone())
    }

    pub fn engine_count(&self) -> usize {
        self.engines.len()
    }

    pub fn event(&self, index: u32) -> Option<Arc<EventSlot>> {
        self.events.get(index as usize).cloned()
    }

    pub fn event_count(&self) -> u32 {
        self.events.len() as u32
    }

    /// Completion interrupt for an engine.
    pub fn handle_engine_interrupt(&self, direction: Direction, channel: u32) -> Option<Terminal> {
        self.engine(direction, channel)?.on_hardware_completion()
    }

    /// User interrupt callback: pulse event slot `index`.
    pub fn signal_user_event(&self, index: u32) -> AdmaResult<()> {
        let slot = self.events.get(index as usize).ok_or_else(|| {
            AdmaError::InvalidParameter(format!("event_{} does not exist", index))
        })?;
        log::info!("event_{} signaling completion", index);
        slot.signal();
        Ok(())
    }

    /// Streaming completion on C2H engine `channel`: append the bytes the
    /// hardware just delivered to the engine's ring.
    pub fn stream_completion(&self, channel: u32, data: &[u8]) -> AdmaResult<()> {
        let engine = self.engine(Direction::C2H, channel).ok_or_else(|| {
            AdmaError::InvalidParameter(format!("c2h_{} does not exist", channel))
        })?;
        engine.on_stream_data(data)
    }

    /// Open a handle on node `name`.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` for unknown names, a user or bypass node whose BAR
    /// does not exist, a DMA node without an enabled engine, or an event
    /// index the device does not have.
    pub fn open(&self, name: &str) -> AdmaResult<FileHandle> {
        let (node, index) = lookup_node(name).ok_or_else(|| {
            log::error!("unknown device node '{}'", name);
            AdmaError::InvalidParameter(format!("unknown device node '{}'", name))
        })?;

        let binding = match node {
            NodeType::Control => self.window_binding(Some(self.config_bar), name)?,
            NodeType::User => self.window_binding(self.user_bar, name)?,
            NodeType::Bypass => self.window_binding(self.bypass_bar, name)?,
            NodeType::Event => NodeBinding::Event(self.event(index).ok_or_else(|| {
                log::error!("{} does not exist", name);
                AdmaError::InvalidParameter(format!("{} does not exist", name))
            })?),
            NodeType::H2C | NodeType::AdvancedH2C => {
                self.dma_binding(node, Direction::H2C, index, name)?
            }
            NodeType::C2H | NodeType::AdvancedC2H => {
                self.dma_binding(node, Direction::C2H, index, name)?
            }
        };

        log::info!("opened {} ({:?})", name, node);
        Ok(FileHandle::new(
            name,
            node,
            binding,
            self.bars.len(),
            &self.config,
        ))
    }

    fn window_binding(&self, bar: Option<usize>, name: &str) -> AdmaResult<NodeBinding> {
        let bar = bar.ok_or_else(|| {
            log::error!("{} BAR does not exist", name);
            AdmaError::InvalidParameter(format!("{} BAR does not exist", name))
        })?;
        let window = self
            .bars
            .get(bar)
            .cloned()
            .ok_or_else(|| AdmaError::InvalidParameter(format!("BAR {} does not exist", bar)))?;
        Ok(NodeBinding::Window { bar, window })
    }

    fn dma_binding(
        &self,
        node: NodeType,
        direction: Direction,
        channel: u32,
        name: &str,
    ) -> AdmaResult<NodeBinding> {
        let slot = self
            .engines
            .get(&(direction, channel))
            .filter(|slot| slot.engine.is_enabled());
        let (engine, queue) = match slot {
            Some(EngineSlot {
                engine,
                queue: Some(queue),
            }) => (engine.clone(), queue.clone()),
            _ => {
                log::error!("{} engine does not exist or is disabled", name);
                return Err(AdmaError::InvalidParameter(format!(
                    "{} engine does not exist or is disabled",
                    name
                )));
            }
        };

        engine.configure_interrupts();

        if node == NodeType::C2H && engine.transfer_mode() == TransferMode::Streaming {
            let ring = engine.setup_ring()?;
            Ok(NodeBinding::Stream { engine, ring })
        } else {
            Ok(NodeBinding::Dma { engine, queue })
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        for slot in self.engines.values() {
            if let Some(queue) = &slot.queue {
                queue.shutdown();
            }
            slot.engine.teardown_ring();
        }
        log::debug!("device detached");
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("bars", &self.bars.len())
            .field("engines", &self.engines.len())
            .field("events", &self.events.len())
            .finish()
    }
}

const LOOPBACK_MEMORY_SIZE: usize = 1024 * 1024;
const LOOPBACK_BAR_SIZE: usize = 64 * 1024;

/// The software hardware behind [`Device::loopback`], for preloading card
/// memory, stalling engines and injecting faults.
pub struct LoopbackHardware {
    pub h2c: Vec<Arc<LoopbackEngine>>,
    pub c2h: Vec<Arc<LoopbackEngine>>,
    pub user: Arc<MemoryWindow>,
    pub control: Arc<MemoryWindow>,
    pub bypass: Arc<MemoryWindow>,
}

impl LoopbackHardware {
    fn new(memory_size: usize, bar_size: usize) -> Self {
        let (h2c, c2h): (Vec<_>, Vec<_>) = (0..2)
            .map(|_| {
                let (h2c, c2h) = LoopbackEngine::pair(memory_size);
                (Arc::new(h2c), Arc::new(c2h))
            })
            .unzip();
        Self {
            h2c,
            c2h,
            user: Arc::new(MemoryWindow::new(bar_size)),
            control: Arc::new(MemoryWindow::new(bar_size)),
            bypass: Arc::new(MemoryWindow::new(bar_size)),
        }
    }

    fn resources(&self) -> DeviceResources {
        let engine = |hw: &Arc<LoopbackEngine>, channel, transfer_mode, completion_mode| {
            EngineDescriptor {
                direction: hw.direction(),
                channel,
                transfer_mode,
                completion_mode,
                enabled: true,
                hw: hw.clone(),
            }
        };
        DeviceResources {
            bars: vec![
                self.user.clone(),
                self.control.clone(),
                self.bypass.clone(),
            ],
            config_bar: 1,
            user_bar: Some(0),
            bypass_bar: Some(2),
            engines: vec![
                engine(&self.h2c[0], 0, TransferMode::Block, CompletionMode::Interrupt),
                engine(&self.c2h[0], 0, TransferMode::Block, CompletionMode::Interrupt),
                engine(&self.h2c[1], 1, TransferMode::Block, CompletionMode::Poll),
                engine(&self.c2h[1], 1, TransferMode::Streaming, CompletionMode::Interrupt),
            ],
            event_count: MAX_USER_EVENTS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineHw;
    use crate::transaction::TransactionState;

    #[test]
    fn test_node_table() {
        assert_eq!(lookup_node("control"), Some((NodeType::Control, 0)));
        assert_eq!(lookup_node("ac2h_3"), Some((NodeType::AdvancedC2H, 3)));
        assert_eq!(lookup_node("event_15"), Some((NodeType::Event, 15)));
        assert_eq!(lookup_node("event_16"), None);
        assert_eq!(lookup_node("h2c_4"), None);
        assert_eq!(lookup_node(""), None);
        assert_eq!(NodeType::AdvancedH2C.direction(), Some(Direction::H2C));
        assert!(NodeType::Bypass.is_window());
        assert_eq!(NodeType::Event.direction(), None);
    }

    #[test]
    fn test_loopback_attach() {
        let (device, _hw) = Device::loopback(DeviceConfig::default()).unwrap();
        assert_eq!(device.engine_count(), 4);
        assert_eq!(device.event_count(), MAX_USER_EVENTS);
        let c2h1 = device.engine(Direction::C2H, 1).unwrap();
        assert_eq!(c2h1.transfer_mode(), TransferMode::Streaming);
        assert!(device.engine(Direction::H2C, 2).is_none());
    }

    #[test]
    fn test_open_errors() {
        let hw = Arc::new(LoopbackEngine::new(Direction::H2C, 1024));
        let device = Device::attach(
            DeviceResources {
                bars: vec![Arc::new(MemoryWindow::new(4096))],
                config_bar: 0,
                user_bar: None,
                bypass_bar: None,
                engines: vec![EngineDescriptor {
                    direction: Direction::H2C,
                    channel: 0,
                    transfer_mode: TransferMode::Block,
                    completion_mode: CompletionMode::Interrupt,
                    enabled: false,
                    hw: hw.clone(),
                }],
                event_count: 2,
            },
            DeviceConfig::default(),
        )
        .unwrap();

        for name in ["nonsense", "user", "bypass", "h2c_0", "c2h_0", "event_2"] {
            assert!(
                matches!(device.open(name), Err(AdmaError::InvalidParameter(_))),
                "{} should not open",
                name
            );
        }
        assert!(device.open("control").is_ok());
        assert!(device.open("event_1").is_ok());
    }

    #[test]
    fn test_attach_validation() {
        let resources = |config_bar, event_count| DeviceResources {
            bars: vec![Arc::new(MemoryWindow::new(64))],
            config_bar,
            user_bar: None,
            bypass_bar: None,
            engines: Vec::new(),
            event_count,
        };
        assert!(Device::attach(resources(1, 0), DeviceConfig::default()).is_err());
        assert!(Device::attach(resources(0, 17), DeviceConfig::default()).is_err());
        assert!(Device::attach(resources(0, 16), DeviceConfig::default()).is_ok());

        let hw: Arc<dyn EngineHw> = Arc::new(LoopbackEngine::new(Direction::C2H, 64));
        let desc = EngineDescriptor {
            direction: Direction::C2H,
            channel: 0,
            transfer_mode: TransferMode::Block,
            completion_mode: CompletionMode::Poll,
            enabled: true,
            hw,
        };
        let mut duplicate = resources(0, 0);
        duplicate.engines = vec![desc.clone(), desc.clone()];
        assert!(Device::attach(duplicate, DeviceConfig::default()).is_err());

        let mut out_of_range = resources(0, 0);
        out_of_range.engines = vec![EngineDescriptor {
            channel: MAX_CHANNELS,
            ..desc
        }];
        assert!(Device::attach(out_of_range, DeviceConfig::default()).is_err());
    }

    #[test]
    fn test_open_configures_interrupts() {
        let (device, hw) = Device::loopback(DeviceConfig::default()).unwrap();
        assert!(!hw.h2c[0].interrupts_enabled());
        let _h2c0 = device.open("h2c_0").unwrap();
        assert!(hw.h2c[0].interrupts_enabled());

        // Poll engine: interrupts disabled on open, even if enabled before.
        device.engine(Direction::H2C, 1).unwrap().set_interrupts(true);
        let _h2c1 = device.open("ah2c_1").unwrap();
        assert!(!hw.h2c[1].interrupts_enabled());
    }

    #[test]
    fn test_engine_interrupt_routed_by_direction_and_channel() {
        let (device, hw) = Device::loopback(DeviceConfig::default()).unwrap();
        let h2c = device.open("h2c_0").unwrap();
        let engine = device.engine(Direction::H2C, 0).unwrap();
        // Deliver the interrupt by hand instead of from the loopback thread.
        engine.set_interrupts(false);
        hw.h2c[0].set_stalled(true);

        let request = h2c.submit_write(vec![4; 48], 0x40).unwrap();
        while engine.state() != TransactionState::Executing {
            std::thread::yield_now();
        }
        assert!(device.handle_engine_interrupt(Direction::H2C, 0).is_none());
        hw.h2c[0].set_stalled(false);

        assert!(device.handle_engine_interrupt(Direction::C2H, 0).is_none());
        assert!(device.handle_engine_interrupt(Direction::H2C, 3).is_none());
        assert_eq!(
            device.handle_engine_interrupt(Direction::H2C, 0),
            Some(Terminal::Completed { bytes: 48 })
        );
        assert_eq!(request.wait().unwrap(), 48);
        assert!(device.handle_engine_interrupt(Direction::H2C, 0).is_none());
        assert_eq!(hw.h2c[0].read_device_memory(0x40, 48), vec![4; 48]);
    }

    #[test]
    fn test_signal_user_event_bounds() {
        let (device, _hw) = Device::loopback(DeviceConfig::default()).unwrap();
        assert!(device.signal_user_event(15).is_ok());
        assert!(matches!(
            device.signal_user_event(16),
            Err(AdmaError::InvalidParameter(_))
        ));
        assert!(device.stream_completion(3, b"x").is_err());
    }
}
