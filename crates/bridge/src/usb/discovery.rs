//! Device discovery
//!
//! Walks configurations, interfaces and alternate settings of every attached
//! device, keeps the interfaces matching the class/protocol filter that
//! expose an interrupt-IN endpoint, then opens, configures and claims them.
//! A device failing any step is logged and skipped.

use crate::usb::backend::usb_error_code;
use crate::usb::device::{DeviceInfo, EndpointInfo, HidDevice, InterruptDevice, map_device_speed};
use protocol::{DeviceSummary, InterfaceFilter};
use rusb::{Context, Device, DeviceHandle, Direction, TransferType, UsbContext};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Endpoint as described by an interface descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDesc {
    pub address: u8,
    pub direction: Direction,
    pub transfer_type: TransferType,
    pub max_packet_size: u16,
    pub interval: u8,
}

/// One alternate setting of one interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AltSetting {
    /// bConfigurationValue of the owning configuration
    pub config_value: u8,
    pub interface: u8,
    pub setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoints: Vec<EndpointDesc>,
}

impl AltSetting {
    fn interrupt_in(&self) -> Option<&EndpointDesc> {
        self.endpoints.iter().find(|ep| {
            ep.direction == Direction::In && ep.transfer_type == TransferType::Interrupt
        })
    }
}

/// Pick one endpoint per interface.
///
/// For each interface number the first alternate setting (in descriptor
/// order) that matches the filter and has an interrupt-IN endpoint wins.
pub fn select_endpoints(settings: &[AltSetting], filter: &InterfaceFilter) -> Vec<EndpointInfo> {
    let mut seen = HashSet::new();
    let mut selected = Vec::new();

    for alt in settings {
        if seen.contains(&alt.interface) {
            continue;
        }
        if !filter.matches(alt.class, alt.subclass, alt.protocol) {
            continue;
        }
        if let Some(ep) = alt.interrupt_in() {
            seen.insert(alt.interface);
            selected.push(EndpointInfo {
                address: ep.address,
                interface: alt.interface,
                setting: alt.setting,
                config: alt.config_value,
                max_packet_size: ep.max_packet_size,
                interval: ep.interval,
            });
        }
    }

    selected
}

/// Check a VID/PID pair against `VID:PID` allow-list entries.
///
/// Entries look like `0x046d:0xc077` or `046d:*`. An empty list allows
/// everything.
pub fn check_filter(vid: u16, pid: u16, filters: &[String]) -> bool {
    if filters.is_empty() {
        return true;
    }

    let field_matches = |pattern: &str, value: u16| {
        let hex = pattern
            .strip_prefix("0x")
            .or_else(|| pattern.strip_prefix("0X"))
            .unwrap_or(pattern);
        pattern == "*"
            || u16::from_str_radix(hex, 16)
                .map(|v| v == value)
                .unwrap_or(false)
    };

    filters.iter().any(|filter| match filter.split_once(':') {
        Some((vid_pattern, pid_pattern)) => {
            field_matches(vid_pattern, vid) && field_matches(pid_pattern, pid)
        }
        None => false,
    })
}

/// A matching interface found during a scan, not yet opened
pub struct Candidate {
    pub device: Device<Context>,
    pub info: DeviceInfo,
    pub endpoint: EndpointInfo,
}

impl Candidate {
    pub fn summary(&self) -> DeviceSummary {
        DeviceSummary {
            slot: None,
            vendor_id: self.info.vendor_id,
            product_id: self.info.product_id,
            bus_number: self.info.bus_number,
            device_address: self.info.device_address,
            interface: self.endpoint.interface,
            endpoint: self.endpoint.address,
            max_packet_size: self.endpoint.max_packet_size,
            product: self.info.product.clone(),
            speed: self.info.speed,
            streaming: false,
        }
    }
}

/// Failure to bring up one candidate
#[derive(Debug, Error)]
#[error("{step} failed: {source}")]
pub struct DiscoveryError {
    pub step: &'static str,
    #[source]
    pub source: rusb::Error,
}

impl DiscoveryError {
    fn at(step: &'static str) -> impl FnOnce(rusb::Error) -> Self {
        move |source| Self { step, source }
    }

    pub fn code(&self) -> i32 {
        usb_error_code(self.source)
    }
}

fn alt_settings<T: UsbContext>(device: &Device<T>) -> Result<Vec<AltSetting>, rusb::Error> {
    let desc = device.device_descriptor()?;
    let mut settings = Vec::new();

    for index in 0..desc.num_configurations() {
        let config = match device.config_descriptor(index) {
            Ok(config) => config,
            Err(e) => {
                debug!(
                    "Skipping configuration {} of bus {:03} addr {:03}: {}",
                    index,
                    device.bus_number(),
                    device.address(),
                    e
                );
                continue;
            }
        };

        for interface in config.interfaces() {
            for alt in interface.descriptors() {
                settings.push(AltSetting {
                    config_value: config.number(),
                    interface: alt.interface_number(),
                    setting: alt.setting_number(),
                    class: alt.class_code(),
                    subclass: alt.sub_class_code(),
                    protocol: alt.protocol_code(),
                    endpoints: alt
                        .endpoint_descriptors()
                        .map(|ep| EndpointDesc {
                            address: ep.address(),
                            direction: ep.direction(),
                            transfer_type: ep.transfer_type(),
                            max_packet_size: ep.max_packet_size(),
                            interval: ep.interval(),
                        })
                        .collect(),
                });
            }
        }
    }

    Ok(settings)
}

/// Enumerate matching interfaces without opening anything
pub fn scan(
    ctx: &Context,
    filter: &InterfaceFilter,
    id_filters: &[String],
) -> Result<Vec<Candidate>, rusb::Error> {
    let mut candidates = Vec::new();

    for device in ctx.devices()?.iter() {
        let desc = match device.device_descriptor() {
            Ok(desc) => desc,
            Err(e) => {
                debug!("Skipping device without descriptor: {}", e);
                continue;
            }
        };

        if !check_filter(desc.vendor_id(), desc.product_id(), id_filters) {
            debug!(
                "Device ignored by filter: {:04x}:{:04x}",
                desc.vendor_id(),
                desc.product_id()
            );
            continue;
        }

        let settings = match alt_settings(&device) {
            Ok(settings) => settings,
            Err(e) => {
                debug!(
                    "Could not read descriptors of {:04x}:{:04x}: {}",
                    desc.vendor_id(),
                    desc.product_id(),
                    e
                );
                continue;
            }
        };

        for endpoint in select_endpoints(&settings, filter) {
            candidates.push(Candidate {
                device: device.clone(),
                info: DeviceInfo {
                    vendor_id: desc.vendor_id(),
                    product_id: desc.product_id(),
                    bus_number: device.bus_number(),
                    device_address: device.address(),
                    product: None,
                    speed: map_device_speed(device.speed()),
                },
                endpoint,
            });
        }
    }

    Ok(candidates)
}

/// Open, configure and claim one candidate.
///
/// On failure everything acquired so far is given back before returning.
pub fn open_candidate(candidate: Candidate) -> Result<HidDevice, DiscoveryError> {
    let Candidate {
        device,
        mut info,
        endpoint,
    } = candidate;
    let iface = endpoint.interface;

    let mut handle = device.open().map_err(DiscoveryError::at("open"))?;

    if let Ok(desc) = device.device_descriptor() {
        info.product = handle.read_product_string_ascii(&desc).ok();
    }

    let detached = match handle.kernel_driver_active(iface) {
        Ok(true) => {
            handle
                .detach_kernel_driver(iface)
                .map_err(DiscoveryError::at("detach kernel driver"))?;
            debug!("Detached kernel driver from interface {} on {}", iface, info);
            true
        }
        Ok(false) => false,
        Err(e) => {
            debug!(
                "Could not check kernel driver status for interface {}: {}",
                iface, e
            );
            false
        }
    };

    if let Err(e) = configure_and_claim(&mut handle, &endpoint) {
        if detached && let Err(err) = handle.attach_kernel_driver(iface) {
            debug!(
                "Could not reattach kernel driver to interface {}: {}",
                iface, err
            );
        }
        return Err(e);
    }

    Ok(HidDevice::new(info, endpoint, handle, detached))
}

fn configure_and_claim(
    handle: &mut DeviceHandle<Context>,
    endpoint: &EndpointInfo,
) -> Result<(), DiscoveryError> {
    // Setting the active configuration again resets the device
    let active = handle
        .active_configuration()
        .map_err(DiscoveryError::at("get configuration"))?;
    if active != endpoint.config {
        handle
            .set_active_configuration(endpoint.config)
            .map_err(DiscoveryError::at("set configuration"))?;
    }

    handle
        .claim_interface(endpoint.interface)
        .map_err(DiscoveryError::at("claim interface"))?;

    if endpoint.setting != 0
        && let Err(e) = handle.set_alternate_setting(endpoint.interface, endpoint.setting)
    {
        if let Err(err) = handle.release_interface(endpoint.interface) {
            debug!(
                "Could not release interface {} after failed setup: {}",
                endpoint.interface, err
            );
        }
        return Err(DiscoveryError::at("set alternate setting")(e));
    }

    Ok(())
}

/// Scan, then bring up every candidate that can be claimed.
///
/// Returns the devices in enumeration order. A single device failing is not
/// an error; failing to enumerate at all is.
pub fn discover(
    ctx: &Context,
    filter: &InterfaceFilter,
    id_filters: &[String],
) -> Result<Vec<HidDevice>, rusb::Error> {
    let candidates = scan(ctx, filter, id_filters)?;
    let mut claimed = HashSet::new();
    let mut devices = Vec::new();

    for candidate in candidates {
        let key = (
            candidate.info.bus_number,
            candidate.info.device_address,
            candidate.endpoint.interface,
        );
        if !claimed.insert(key) {
            continue;
        }

        let label = format!(
            "{} bus {:03} addr {:03} if {}",
            candidate.info,
            candidate.info.bus_number,
            candidate.info.device_address,
            candidate.endpoint.interface
        );

        match open_candidate(candidate) {
            Ok(device) => {
                info!(
                    "Found mouse {} ep {:#04x} maxp {}",
                    label,
                    device.endpoint().address,
                    device.endpoint().max_packet_size
                );
                devices.push(device);
            }
            Err(e) => {
                warn!("Skipping {}: {} (status {})", label, e, e.code());
            }
        }
    }

    info!("Discovery claimed {} device(s)", devices.len());
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{HID_CLASS, HID_PROTOCOL_KEYBOARD, HID_PROTOCOL_MOUSE, HID_SUBCLASS_BOOT};

    fn ep(address: u8, transfer_type: TransferType) -> EndpointDesc {
        EndpointDesc {
            address,
            direction: if address & 0x80 != 0 {
                Direction::In
            } else {
                Direction::Out
            },
            transfer_type,
            max_packet_size: 8,
            interval: 10,
        }
    }

    fn alt(interface: u8, setting: u8, protocol: u8, endpoints: Vec<EndpointDesc>) -> AltSetting {
        AltSetting {
            config_value: 1,
            interface,
            setting,
            class: HID_CLASS,
            subclass: HID_SUBCLASS_BOOT,
            protocol,
            endpoints,
        }
    }

    #[test]
    fn test_selects_interrupt_in_of_mouse_interface() {
        let settings = vec![
            alt(
                0,
                0,
                HID_PROTOCOL_KEYBOARD,
                vec![ep(0x81, TransferType::Interrupt)],
            ),
            alt(
                1,
                0,
                HID_PROTOCOL_MOUSE,
                vec![
                    ep(0x02, TransferType::Interrupt),
                    ep(0x83, TransferType::Bulk),
                    ep(0x82, TransferType::Interrupt),
                ],
            ),
        ];

        let selected = select_endpoints(&settings, &InterfaceFilter::boot_mouse());
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].interface, 1);
        assert_eq!(selected[0].address, 0x82);
        assert_eq!(selected[0].config, 1);
    }

    #[test]
    fn test_first_matching_alt_setting_wins() {
        let settings = vec![
            alt(0, 0, HID_PROTOCOL_MOUSE, vec![]),
            alt(0, 1, HID_PROTOCOL_MOUSE, vec![ep(0x81, TransferType::Interrupt)]),
            alt(0, 2, HID_PROTOCOL_MOUSE, vec![ep(0x82, TransferType::Interrupt)]),
        ];

        let selected = select_endpoints(&settings, &InterfaceFilter::boot_mouse());
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].setting, 1);
        assert_eq!(selected[0].address, 0x81);
    }

    #[test]
    fn test_no_interrupt_in_no_selection() {
        let settings = vec![alt(
            0,
            0,
            HID_PROTOCOL_MOUSE,
            vec![ep(0x01, TransferType::Interrupt), ep(0x81, TransferType::Bulk)],
        )];
        assert!(select_endpoints(&settings, &InterfaceFilter::boot_mouse()).is_empty());
    }

    #[test]
    fn test_one_endpoint_per_interface() {
        let mut second_config =
            alt(0, 0, HID_PROTOCOL_MOUSE, vec![ep(0x84, TransferType::Interrupt)]);
        second_config.config_value = 2;
        let settings = vec![
            alt(0, 0, HID_PROTOCOL_MOUSE, vec![ep(0x81, TransferType::Interrupt)]),
            second_config,
            alt(2, 0, HID_PROTOCOL_MOUSE, vec![ep(0x83, TransferType::Interrupt)]),
        ];

        let selected = select_endpoints(&settings, &InterfaceFilter::boot_mouse());
        let interfaces: Vec<u8> = selected.iter().map(|e| e.interface).collect();
        assert_eq!(interfaces, vec![0, 2]);
        assert_eq!(selected[0].address, 0x81);
    }

    #[test]
    fn test_filter_logic() {
        let filters = vec!["0x1234:0x5678".to_string(), "0xABCD:*".to_string()];

        assert!(check_filter(0x1234, 0x5678, &filters));
        assert!(check_filter(0xABCD, 0x1111, &filters));
        assert!(check_filter(0xABCD, 0x9999, &filters));

        assert!(!check_filter(0x1234, 0x9999, &filters));
        assert!(!check_filter(0x9999, 0x5678, &filters));
        assert!(!check_filter(0x0000, 0x0000, &filters));

        // Empty filters = allow all
        assert!(check_filter(0x1234, 0x5678, &[]));
    }

    #[test]
    fn test_upper_case_prefix_matches() {
        let filters = vec!["0X046D:*".to_string(), "0x1bcf:0X0005".to_string()];

        assert!(check_filter(0x046d, 0xc077, &filters));
        assert!(check_filter(0x1bcf, 0x0005, &filters));
        assert!(!check_filter(0x1bcf, 0x0006, &filters));
    }

    #[test]
    fn test_validated_filters_match() {
        let mut config = crate::config::BridgeConfig::default();
        config.usb.filters = vec!["0X046D:*".to_string(), "0x046d:0XC077".to_string()];
        config.validate().unwrap();

        for filter in &config.usb.filters {
            assert!(
                check_filter(0x046d, 0xc077, std::slice::from_ref(filter)),
                "{} passed validation but matches nothing",
                filter
            );
        }
    }

    #[test]
    fn test_malformed_filter_entry_matches_nothing() {
        let filters = vec!["1234".to_string(), "zz:zz".to_string()];
        assert!(!check_filter(0x1234, 0x0000, &filters));
    }

    #[test]
    fn test_discovery_error_code() {
        let err = DiscoveryError {
            step: "claim interface",
            source: rusb::Error::Busy,
        };
        assert_eq!(err.code(), -6);
        assert!(err.to_string().starts_with("claim interface failed: "));
    }
}
