//! Predefined services and characteristics used by the server and the demo.
//!
//! Only the handful of types the accessory core itself relies on live here;
//! applications build others with [`Service::new`] and [`Characteristic::new`].

use std::sync::Arc;

use uuid::Uuid;

use crate::characteristic::Characteristic;
use crate::service::Service;
use crate::value::{CharProps, CharValue, Format, Perm};

const fn apple(short: u32) -> Uuid {
    Uuid::from_fields(
        short,
        0x0000,
        0x1000,
        &[0x80, 0x00, 0x00, 0x26, 0xBB, 0x76, 0x52, 0x91],
    )
}

// services
pub const ACCESSORY_INFORMATION: Uuid = apple(0x3E);
pub const PROTOCOL_INFORMATION: Uuid = apple(0xA2);
pub const LIGHTBULB: Uuid = apple(0x43);
pub const SWITCH: Uuid = apple(0x49);
pub const STATELESS_PROGRAMMABLE_SWITCH: Uuid = apple(0x89);

// characteristics
pub const BRIGHTNESS: Uuid = apple(0x08);
pub const HUE: Uuid = apple(0x13);
pub const IDENTIFY: Uuid = apple(0x14);
pub const MANUFACTURER: Uuid = apple(0x20);
pub const MODEL: Uuid = apple(0x21);
pub const NAME: Uuid = apple(0x23);
pub const ON: Uuid = apple(0x25);
pub const SATURATION: Uuid = apple(0x2F);
pub const SERIAL_NUMBER: Uuid = apple(0x30);
pub const VERSION: Uuid = apple(0x37);
pub const FIRMWARE_REVISION: Uuid = apple(0x52);
pub const PROGRAMMABLE_SWITCH_EVENT: Uuid = apple(0x73);
pub const COLOR_TEMPERATURE: Uuid = apple(0xCE);
pub const TRANSITION_CONTROL: Uuid = apple(0x143);
pub const SUPPORTED_TRANSITION_CONFIGURATION: Uuid = apple(0x144);
pub const ACTIVE_TRANSITION_COUNT: Uuid = apple(0x24B);

pub const PROTOCOL_VERSION: &str = "1.1.0";

const READ_NOTIFY: &[Perm] = &[Perm::PairedRead, Perm::Notify];
const READ_WRITE_NOTIFY: &[Perm] = &[Perm::PairedRead, Perm::PairedWrite, Perm::Notify];

fn read_only_string(name: &str, uuid: Uuid, value: &str) -> Arc<Characteristic> {
    Characteristic::with_value(
        name,
        uuid,
        CharProps::new(Format::String, &[Perm::PairedRead]),
        value,
    )
}

pub fn identify() -> Arc<Characteristic> {
    Characteristic::new(
        "Identify",
        IDENTIFY,
        CharProps::new(Format::Bool, &[Perm::PairedWrite]),
    )
}

pub fn name(value: &str) -> Arc<Characteristic> {
    read_only_string("Name", NAME, value)
}

pub fn manufacturer(value: &str) -> Arc<Characteristic> {
    read_only_string("Manufacturer", MANUFACTURER, value)
}

pub fn model(value: &str) -> Arc<Characteristic> {
    read_only_string("Model", MODEL, value)
}

pub fn serial_number(value: &str) -> Arc<Characteristic> {
    read_only_string("Serial Number", SERIAL_NUMBER, value)
}

pub fn firmware_revision(value: &str) -> Arc<Characteristic> {
    read_only_string("Firmware Revision", FIRMWARE_REVISION, value)
}

pub fn version(value: &str) -> Arc<Characteristic> {
    Characteristic::with_value(
        "Version",
        VERSION,
        CharProps::new(Format::String, READ_NOTIFY),
        value,
    )
}

pub fn on() -> Arc<Characteristic> {
    Characteristic::new("On", ON, CharProps::new(Format::Bool, READ_WRITE_NOTIFY))
}

pub fn brightness() -> Arc<Characteristic> {
    Characteristic::new(
        "Brightness",
        BRIGHTNESS,
        CharProps::new(Format::Int, READ_WRITE_NOTIFY)
            .with_range(0.0, 100.0, 1.0)
            .with_unit("percentage"),
    )
}

pub fn hue() -> Arc<Characteristic> {
    Characteristic::new(
        "Hue",
        HUE,
        CharProps::new(Format::Float, READ_WRITE_NOTIFY)
            .with_range(0.0, 360.0, 1.0)
            .with_unit("arcdegrees"),
    )
}

pub fn saturation() -> Arc<Characteristic> {
    Characteristic::new(
        "Saturation",
        SATURATION,
        CharProps::new(Format::Float, READ_WRITE_NOTIFY)
            .with_range(0.0, 100.0, 1.0)
            .with_unit("percentage"),
    )
}

/// Colour temperature in mired.
pub fn color_temperature() -> Arc<Characteristic> {
    Characteristic::with_value(
        "Color Temperature",
        COLOR_TEMPERATURE,
        CharProps::new(Format::Uint32, READ_WRITE_NOTIFY).with_range(140.0, 500.0, 1.0),
        140u32,
    )
}

/// Button presses: 0 single, 1 double, 2 long. Delivered without coalescing.
pub fn programmable_switch_event() -> Arc<Characteristic> {
    let mut props = CharProps::new(Format::Uint8, READ_NOTIFY).with_valid_values(&[0, 1, 2]);
    props.always_notify = true;
    props.immediate_delivery = true;
    Characteristic::new("Programmable Switch Event", PROGRAMMABLE_SWITCH_EVENT, props)
}

pub fn supported_transition_configuration() -> Arc<Characteristic> {
    Characteristic::new(
        "Supported Characteristic Value Transition Configuration",
        SUPPORTED_TRANSITION_CONFIGURATION,
        CharProps::new(Format::Tlv8, &[Perm::PairedRead]),
    )
}

pub fn transition_control() -> Arc<Characteristic> {
    Characteristic::new(
        "Characteristic Value Transition Control",
        TRANSITION_CONTROL,
        CharProps::new(
            Format::Tlv8,
            &[Perm::PairedRead, Perm::PairedWrite, Perm::WriteResponse],
        ),
    )
}

pub fn active_transition_count() -> Arc<Characteristic> {
    Characteristic::with_value(
        "Characteristic Value Active Transition Count",
        ACTIVE_TRANSITION_COUNT,
        CharProps::new(Format::Uint8, READ_NOTIFY),
        CharValue::UInt(0),
    )
}

fn build(name: &str, uuid: Uuid, subtype: Option<&str>, members: Vec<Arc<Characteristic>>) -> Arc<Service> {
    let service = Service::new(name, uuid, subtype);
    for characteristic in members {
        service.attach_characteristic(characteristic);
    }
    service
}

/// Accessory information service; always `iid` 1.
pub fn accessory_information(display_name: &str) -> Arc<Service> {
    let service = build(
        display_name,
        ACCESSORY_INFORMATION,
        None,
        vec![
            identify(),
            manufacturer("Default-Manufacturer"),
            model("Default-Model"),
            name(display_name),
            serial_number("Default-SerialNumber"),
            firmware_revision("1.0"),
        ],
    );
    service.set_iid(1);
    service
}

pub fn protocol_information() -> Arc<Service> {
    build(
        "Protocol Information",
        PROTOCOL_INFORMATION,
        None,
        vec![version(PROTOCOL_VERSION)],
    )
}

pub fn lightbulb(display_name: &str) -> Arc<Service> {
    build(display_name, LIGHTBULB, None, vec![on(), name(display_name)])
}

pub fn switch(display_name: &str, subtype: Option<&str>) -> Arc<Service> {
    build(display_name, SWITCH, subtype, vec![on(), name(display_name)])
}

pub fn stateless_programmable_switch(display_name: &str, subtype: Option<&str>) -> Arc<Service> {
    build(
        display_name,
        STATELESS_PROGRAMMABLE_SWITCH,
        subtype,
        vec![programmable_switch_event(), name(display_name)],
    )
}
