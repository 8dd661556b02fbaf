//! Adaptive lighting: colour temperature following a controller-supplied curve.
//!
//! A controller writes a transition curve to the Transition Control
//! characteristic; the accessory then periodically derives the colour
//! temperature from the curve, the elapsed time and the current brightness.
//!
//! Transition Control payload:
//!
//! ```text
//! 0x01 read                 (no value)
//! 0x02 update               nested:
//!        0x01 start         unix milliseconds
//!        0x02 curve         nested entries, separated by 0xFF:
//!               0x01 temperature (f32 LE, mired)
//!               0x02 brightness adjustment factor (f32 LE)
//!               0x03 transition time from the previous entry (ms)
//!               0x04 duration the entry is held (ms, optional)
//!        0x03 brightness adjustment minimum
//!        0x04 brightness adjustment maximum
//!        0x05 update interval (ms)
//!        0x06 notify interval threshold (ms)
//! ```
//!
//! An update without a curve disables the transition.

use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hap_core::error::AccessoryError;
use hap_core::status::HapStatus;
use hap_crypto::tlv::{read_uint, write_uint, Tlv8};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::characteristic::{ChangeReason, Characteristic, CharacteristicEvent};
use crate::controller::{Controller, ControllerType, StateChangeNotifier};
use crate::handler::{read_fn, write_fn, ConnectionId};
use crate::observer::SubscriptionHandle;
use crate::service::Service;
use crate::types;
use crate::value::CharValue;

const REQUEST_READ: u8 = 0x01;
const REQUEST_UPDATE: u8 = 0x02;

const UPDATE_START: u8 = 0x01;
const UPDATE_CURVE: u8 = 0x02;
const UPDATE_RANGE_MIN: u8 = 0x03;
const UPDATE_RANGE_MAX: u8 = 0x04;
const UPDATE_INTERVAL: u8 = 0x05;
const UPDATE_NOTIFY_THRESHOLD: u8 = 0x06;

const ENTRY_TEMPERATURE: u8 = 0x01;
const ENTRY_FACTOR: u8 = 0x02;
const ENTRY_TRANSITION_TIME: u8 = 0x03;
const ENTRY_DURATION: u8 = 0x04;

const SUPPORTED_IID: u8 = 0x01;
const SUPPORTED_TYPE: u8 = 0x02;
const TRANSITION_LINEAR: u8 = 0x01;
const TRANSITION_LINEAR_DERIVED: u8 = 0x02;

const DEFAULT_UPDATE_INTERVAL_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurveEntry {
    /// Mired.
    pub temperature: f32,
    pub brightness_adjustment_factor: f32,
    /// Milliseconds from the end of the previous entry.
    pub transition_time: u64,
    /// How long the entry is held; absent on the last entry.
    pub duration: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveTransition {
    pub start_millis: u64,
    pub curve: Vec<CurveEntry>,
    pub brightness_range: (u32, u32),
    pub update_interval_ms: u64,
    pub notify_interval_threshold_ms: u64,
}

impl ActiveTransition {
    /// Nested update payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut curve = Tlv8::new();
        for (i, entry) in self.curve.iter().enumerate() {
            if i > 0 {
                curve.push_separator();
            }
            curve.push_raw(ENTRY_TEMPERATURE, entry.temperature.to_le_bytes().to_vec());
            curve.push_raw(
                ENTRY_FACTOR,
                entry.brightness_adjustment_factor.to_le_bytes().to_vec(),
            );
            curve.push_raw(ENTRY_TRANSITION_TIME, write_uint(entry.transition_time));
            if let Some(duration) = entry.duration {
                curve.push_raw(ENTRY_DURATION, write_uint(duration));
            }
        }

        let mut update = Tlv8::new();
        update.push_raw(UPDATE_START, write_uint(self.start_millis));
        update.push_raw(UPDATE_CURVE, curve.encode());
        update.push_raw(UPDATE_RANGE_MIN, write_uint(self.brightness_range.0 as u64));
        update.push_raw(UPDATE_RANGE_MAX, write_uint(self.brightness_range.1 as u64));
        update.push_raw(UPDATE_INTERVAL, write_uint(self.update_interval_ms));
        update.push_raw(
            UPDATE_NOTIFY_THRESHOLD,
            write_uint(self.notify_interval_threshold_ms),
        );
        update.encode()
    }

    /// Parse a nested update payload; `None` means "disable".
    pub fn decode(bytes: &[u8]) -> Result<Option<Self>, HapStatus> {
        let invalid = |_| HapStatus::InvalidValueInRequest;
        let update = Tlv8::parse(bytes).map_err(invalid)?;
        let curve_bytes = match update.get_raw(UPDATE_CURVE) {
            Some(c) if !c.is_empty() => c,
            _ => return Ok(None),
        };

        let mut curve = Vec::new();
        for group in Tlv8::parse(curve_bytes).map_err(invalid)?.split() {
            curve.push(CurveEntry {
                temperature: read_f32(group.get_raw(ENTRY_TEMPERATURE))?,
                brightness_adjustment_factor: read_f32(group.get_raw(ENTRY_FACTOR))?,
                transition_time: uint_or(group.get_raw(ENTRY_TRANSITION_TIME), 0)?,
                duration: group
                    .get_raw(ENTRY_DURATION)
                    .map(read_uint)
                    .transpose()
                    .map_err(invalid)?,
            });
        }
        if curve.len() < 2 || curve_span(&curve).is_none() {
            return Err(HapStatus::InvalidValueInRequest);
        }

        let min = uint_or(update.get_raw(UPDATE_RANGE_MIN), 0)? as u32;
        let max = uint_or(update.get_raw(UPDATE_RANGE_MAX), 100)? as u32;
        if min > max {
            return Err(HapStatus::InvalidValueInRequest);
        }

        Ok(Some(Self {
            start_millis: uint_or(update.get_raw(UPDATE_START), 0)?,
            curve,
            brightness_range: (min, max),
            update_interval_ms: uint_or(update.get_raw(UPDATE_INTERVAL), DEFAULT_UPDATE_INTERVAL_MS)?
                .max(1),
            notify_interval_threshold_ms: uint_or(update.get_raw(UPDATE_NOTIFY_THRESHOLD), 0)?,
        }))
    }

    /// Full Transition Control write value installing this transition.
    pub fn to_control_request(&self) -> Vec<u8> {
        let mut request = Tlv8::new();
        request.push_raw(REQUEST_UPDATE, self.encode());
        request.encode()
    }
}

/// Total length of the curve in ms, `None` if it does not fit in a `u64`.
fn curve_span(curve: &[CurveEntry]) -> Option<u64> {
    curve.iter().try_fold(0u64, |span, entry| {
        span.checked_add(entry.transition_time)?
            .checked_add(entry.duration.unwrap_or(0))
    })
}

fn read_f32(bytes: Option<&[u8]>) -> Result<f32, HapStatus> {
    let bytes: [u8; 4] = bytes
        .and_then(|b| b.try_into().ok())
        .ok_or(HapStatus::InvalidValueInRequest)?;
    Ok(f32::from_le_bytes(bytes))
}

fn uint_or(bytes: Option<&[u8]>, default: u64) -> Result<u64, HapStatus> {
    match bytes {
        Some(b) => read_uint(b).map_err(|_| HapStatus::InvalidValueInRequest),
        None => Ok(default),
    }
}

/// Where the last lookup ended, so the next one can resume there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cursor {
    curve_index: usize,
    lower_bound_time_offset: u64,
}

/// Locate the curve segment containing `offset` ms into the transition.
///
/// Returns the index of the lower entry and the offset relative to the
/// point where the lower entry became active. A cursor pointing past
/// `offset` (the clock moved backwards) restarts the search from the
/// beginning.
fn find_segment(curve: &[CurveEntry], offset: u64, cursor: &mut Option<Cursor>) -> Option<(usize, u64)> {
    let resumed = cursor.is_some();
    let (mut i, mut lower_offset) = cursor
        .map(|c| (c.curve_index, c.lower_bound_time_offset))
        .unwrap_or((0, 0));

    while i + 1 < curve.len() {
        let lower = &curve[i];
        let upper = &curve[i + 1];
        let lower_duration = lower.duration.unwrap_or(0);
        let lower_bound = lower_offset;
        lower_offset = lower_offset.saturating_add(lower.transition_time);

        if offset >= lower_offset {
            let segment_end = lower_offset
                .saturating_add(lower_duration)
                .saturating_add(upper.transition_time);
            if offset <= segment_end {
                *cursor = Some(Cursor {
                    curve_index: i,
                    lower_bound_time_offset: lower_bound,
                });
                return Some((i, offset - lower_offset));
            }
        } else if resumed {
            *cursor = None;
            return find_segment(curve, offset, cursor);
        }

        lower_offset = lower_offset.saturating_add(lower_duration);
        i += 1;
    }

    *cursor = None;
    None
}

/// Colour temperature for a segment, before clamping to the characteristic range.
fn interpolate(lower: &CurveEntry, upper: &CurveEntry, transition_offset: u64, brightness: f64, range: (u32, u32)) -> f64 {
    let lower_duration = lower.duration.unwrap_or(0);
    let (temperature, factor) = if lower_duration > transition_offset || upper.transition_time == 0 {
        if lower_duration > transition_offset {
            (lower.temperature as f64, lower.brightness_adjustment_factor as f64)
        } else {
            (upper.temperature as f64, upper.brightness_adjustment_factor as f64)
        }
    } else {
        let percentage =
            ((transition_offset - lower_duration) as f64 / upper.transition_time as f64).min(1.0);
        (
            lower.temperature as f64
                + (upper.temperature as f64 - lower.temperature as f64) * percentage,
            lower.brightness_adjustment_factor as f64
                + (upper.brightness_adjustment_factor as f64
                    - lower.brightness_adjustment_factor as f64)
                    * percentage,
        )
    };
    let multiplier = brightness.clamp(range.0 as f64, range.1 as f64);
    (temperature + factor * multiplier).round()
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Default)]
struct State {
    active: Option<ActiveTransition>,
    cursor: Option<Cursor>,
    last_tick: Option<u64>,
}

/// Adaptive lighting for a lightbulb with Brightness and Color Temperature.
pub struct AdaptiveLightingController {
    lightbulb: Arc<Service>,
    brightness: Arc<Characteristic>,
    color_temperature: Arc<Characteristic>,
    supported: Arc<Characteristic>,
    control: Arc<Characteristic>,
    active_count: Arc<Characteristic>,
    state: Mutex<State>,
    notifier: Mutex<Option<StateChangeNotifier>>,
    subscriptions: Mutex<Vec<SubscriptionHandle>>,
    this: Weak<AdaptiveLightingController>,
}

impl AdaptiveLightingController {
    /// Prepare `lightbulb`, adding the transition characteristics it lacks.
    pub fn new(lightbulb: Arc<Service>) -> Result<Arc<Self>, AccessoryError> {
        let brightness = lightbulb
            .characteristic(types::BRIGHTNESS)
            .ok_or_else(|| AccessoryError::NotFound("Brightness characteristic".into()))?;
        let color_temperature = lightbulb
            .characteristic(types::COLOR_TEMPERATURE)
            .ok_or_else(|| AccessoryError::NotFound("Color Temperature characteristic".into()))?;

        let supported = existing_or_add(&lightbulb, types::supported_transition_configuration)?;
        let control = existing_or_add(&lightbulb, types::transition_control)?;
        let active_count = existing_or_add(&lightbulb, types::active_transition_count)?;

        Ok(Arc::new_cyclic(|this| Self {
            lightbulb,
            brightness,
            color_temperature,
            supported,
            control,
            active_count,
            state: Mutex::new(State::default()),
            notifier: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
            this: this.clone(),
        }))
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active.is_some()
    }

    pub fn active_transition(&self) -> Option<ActiveTransition> {
        self.state.lock().active.clone()
    }

    /// How often [`tick`](Self::tick) should run while active.
    pub fn update_interval(&self) -> Option<Duration> {
        self.state
            .lock()
            .active
            .as_ref()
            .map(|t| Duration::from_millis(t.update_interval_ms))
    }

    /// Recompute the colour temperature at the current wall-clock time.
    pub fn tick(&self) -> Option<u32> {
        self.update_color_temperature(now_millis())
    }

    /// Recompute the colour temperature at `now` (unix ms).
    ///
    /// Ends the transition when `now` is past the end of the curve.
    pub fn update_color_temperature(&self, now: u64) -> Option<u32> {
        let brightness = self.brightness.value().as_f64().unwrap_or(100.0);
        let props = self.color_temperature.props();
        let (min, max) = (
            props.min_value.unwrap_or(140.0),
            props.max_value.unwrap_or(500.0),
        );

        let temperature = {
            let mut state = self.state.lock();
            state.last_tick = Some(now);
            let State { active, cursor, .. } = &mut *state;
            let transition = active.as_ref()?;
            let offset = now.saturating_sub(transition.start_millis);
            match find_segment(&transition.curve, offset, cursor) {
                Some((index, transition_offset)) => Some(
                    interpolate(
                        &transition.curve[index],
                        &transition.curve[index + 1],
                        transition_offset,
                        brightness,
                        transition.brightness_range,
                    )
                    .clamp(min, max) as u32,
                ),
                None => None,
            }
        };

        match temperature {
            Some(temperature) => {
                self.color_temperature.update_value(temperature);
                Some(temperature)
            }
            None => {
                info!("Adaptive lighting curve finished");
                self.deactivate();
                None
            }
        }
    }

    fn activate(&self, transition: ActiveTransition) {
        debug!(
            entries = transition.curve.len(),
            start = transition.start_millis,
            "Adaptive lighting transition installed"
        );
        {
            let mut state = self.state.lock();
            state.active = Some(transition);
            state.cursor = None;
        }
        self.active_count.update_value(1u8);
        self.notify_state_change();
    }

    fn deactivate(&self) {
        let was_active = {
            let mut state = self.state.lock();
            state.cursor = None;
            state.active.take().is_some()
        };
        if was_active {
            self.active_count.update_value(0u8);
            self.notify_state_change();
        }
    }

    fn notify_state_change(&self) {
        let notifier = self.notifier.lock().clone();
        if let Some(notify) = notifier {
            notify();
        }
    }

    fn state_payload(&self) -> Vec<u8> {
        let mut response = Tlv8::new();
        if let Some(transition) = self.state.lock().active.as_ref() {
            response.push_raw(REQUEST_UPDATE, transition.encode());
        }
        response.encode()
    }

    fn supported_configuration(&self) -> Vec<u8> {
        let mut tlv = Tlv8::new();
        tlv.push_raw(SUPPORTED_IID, write_uint(self.brightness.iid()));
        tlv.push_raw(SUPPORTED_TYPE, vec![TRANSITION_LINEAR]);
        tlv.push_separator();
        tlv.push_raw(SUPPORTED_IID, write_uint(self.color_temperature.iid()));
        tlv.push_raw(SUPPORTED_TYPE, vec![TRANSITION_LINEAR_DERIVED]);
        tlv.encode()
    }

    fn handle_control_write(&self, value: &CharValue) -> Result<Option<CharValue>, HapStatus> {
        let bytes = value.as_bytes().ok_or(HapStatus::InvalidValueInRequest)?;
        let request = Tlv8::parse(bytes).map_err(|_| HapStatus::InvalidValueInRequest)?;
        if let Some(update) = request.get_raw(REQUEST_UPDATE) {
            match ActiveTransition::decode(update)? {
                Some(transition) => {
                    self.activate(transition);
                    let now = now_millis();
                    self.update_color_temperature(now);
                }
                None => self.deactivate(),
            }
        } else if request.get_raw(REQUEST_READ).is_none() {
            return Err(HapStatus::InvalidValueInRequest);
        }
        Ok(Some(CharValue::Data(self.state_payload())))
    }
}

fn existing_or_add(
    service: &Service,
    build: fn() -> Arc<Characteristic>,
) -> Result<Arc<Characteristic>, AccessoryError> {
    let fresh = build();
    match service.characteristic(fresh.uuid()) {
        Some(existing) => Ok(existing),
        None => service.add_characteristic(fresh),
    }
}

impl Controller for AdaptiveLightingController {
    fn controller_type(&self) -> ControllerType {
        ControllerType::AdaptiveLighting
    }

    fn construct_services(&self) -> Vec<Arc<Service>> {
        // works on the application's lightbulb service
        Vec::new()
    }

    fn init_with_services(&self, _existing: &[Arc<Service>]) {}

    fn configure_services(&self, on_state_change: StateChangeNotifier) {
        *self.notifier.lock() = Some(on_state_change);

        let this = self.this.clone();
        self.supported.on_read(read_fn(move |_ctx| {
            let this = this.clone();
            async move {
                let controller = this.upgrade().ok_or(HapStatus::ServiceCommunicationFailure)?;
                Ok(CharValue::Data(controller.supported_configuration()))
            }
        }));

        let this = self.this.clone();
        self.control.on_read(read_fn(move |_ctx| {
            let this = this.clone();
            async move {
                let controller = this.upgrade().ok_or(HapStatus::ServiceCommunicationFailure)?;
                Ok(CharValue::Data(controller.state_payload()))
            }
        }));

        let this = self.this.clone();
        self.control.on_write(write_fn(move |value, _ctx| {
            let this = this.clone();
            async move {
                let controller = this.upgrade().ok_or(HapStatus::ServiceCommunicationFailure)?;
                controller.handle_control_write(&value)
            }
        }));

        // a manual colour change ends adaptive lighting
        let this = self.this.clone();
        let manual = self.color_temperature.subscribe(move |event| {
            if let CharacteristicEvent::Change(change) = event {
                if change.reason == ChangeReason::Write {
                    if let Some(controller) = this.upgrade() {
                        debug!("Colour temperature written; disabling adaptive lighting");
                        controller.deactivate();
                    }
                }
            }
        });

        let this = self.this.clone();
        let brightness = self.brightness.subscribe(move |event| {
            if let CharacteristicEvent::Change(change) = event {
                if change.reason != ChangeReason::Read && change.old != change.new {
                    if let Some(controller) = this.upgrade() {
                        let last_tick = controller.state.lock().last_tick;
                        if let Some(now) = last_tick {
                            controller.update_color_temperature(now);
                        }
                    }
                }
            }
        });

        let mut subscriptions = self.subscriptions.lock();
        subscriptions.push(manual);
        subscriptions.push(brightness);
    }

    fn handle_controller_removed(&self) {
        self.deactivate();
        for subscription in self.subscriptions.lock().drain(..) {
            subscription.cancel();
        }
        for uuid in [
            types::SUPPORTED_TRANSITION_CONFIGURATION,
            types::TRANSITION_CONTROL,
            types::ACTIVE_TRANSITION_COUNT,
        ] {
            let _ = self.lightbulb.remove_characteristic(uuid);
        }
        *self.notifier.lock() = None;
    }

    fn handle_factory_reset(&self) {
        self.deactivate();
    }

    fn serialize(&self) -> Option<Value> {
        let state = self.state.lock();
        state
            .active
            .as_ref()
            .and_then(|t| serde_json::to_value(t).ok())
    }

    fn deserialize(&self, state: Value) -> Result<(), AccessoryError> {
        let transition: ActiveTransition = serde_json::from_value(state)
            .map_err(|e| AccessoryError::Controller(format!("adaptive lighting state: {}", e)))?;
        {
            let mut current = self.state.lock();
            current.active = Some(transition);
            current.cursor = None;
        }
        self.active_count.update_value(1u8);
        Ok(())
    }

    fn handle_connection_closed(&self, _connection: ConnectionId) {}
}
