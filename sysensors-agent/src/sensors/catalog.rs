//! Built-in host sensors

use super::{SensorDefinition, SensorValue};
use std::path::Path;
use std::time::Instant;

pub fn builtin() -> Vec<SensorDefinition> {
    vec![
        SensorDefinition::measurement("temperature", "Temperature", |ctx| {
            Ok(SensorValue::fixed(ctx.facts.cpu_temperature()?, 1))
        })
        .unit("°C")
        .device_class("temperature")
        .icon("thermometer"),
        SensorDefinition::measurement("clock_speed", "Clock Speed", |ctx| {
            Ok(SensorValue::Integer(ctx.facts.clock_speed_mhz()? as i64))
        })
        .unit("MHz"),
        SensorDefinition::measurement("disk_use", "Disk Use", |ctx| {
            Ok(SensorValue::fixed(ctx.facts.disk_usage_percent(Path::new("/"))?, 1))
        })
        .unit("%")
        .icon("micro-sd"),
        SensorDefinition::measurement("memory_use", "Memory Use", |ctx| {
            Ok(SensorValue::fixed(ctx.facts.memory_percent()?, 1))
        })
        .unit("%")
        .icon("memory"),
        SensorDefinition::measurement("cpu_usage", "CPU Usage", |ctx| {
            Ok(SensorValue::fixed(ctx.facts.cpu_usage(), 1))
        })
        .unit("%")
        .icon("memory"),
        load_sensor("load_1m", "Load 1m", 0),
        load_sensor("load_5m", "Load 5m", 1),
        load_sensor("load_15m", "Load 15m", 2),
        SensorDefinition::measurement("net_tx", "Network Upload", |ctx| {
            let sent = ctx.facts.network_totals().transmitted;
            Ok(SensorValue::fixed(ctx.rates.sample("net_tx", sent, Instant::now()), 2))
        })
        .unit("Kbps")
        .icon("server-network"),
        SensorDefinition::measurement("net_rx", "Network Download", |ctx| {
            let received = ctx.facts.network_totals().received;
            Ok(SensorValue::fixed(ctx.rates.sample("net_rx", received, Instant::now()), 2))
        })
        .unit("Kbps")
        .icon("server-network"),
        SensorDefinition::measurement("swap_usage", "Swap Usage", |ctx| {
            Ok(SensorValue::fixed(ctx.facts.swap_percent(), 1))
        })
        .unit("%")
        .icon("harddisk"),
        SensorDefinition::binary("power_status", "Under Voltage", |ctx| {
            Ok(SensorValue::Flag(ctx.facts.under_voltage()?))
        })
        .device_class("problem"),
        SensorDefinition::measurement("last_boot", "Last Boot", |ctx| {
            Ok(SensorValue::Text(ctx.facts.last_boot()?))
        })
        .device_class("timestamp")
        .icon("clock"),
        SensorDefinition::measurement("hostname", "Hostname", |ctx| {
            Ok(SensorValue::Text(ctx.facts.hostname()))
        })
        .icon("card-account-details"),
        SensorDefinition::measurement("host_ip", "Host IP", |ctx| {
            Ok(SensorValue::Text(ctx.facts.host_ip()))
        })
        .icon("lan"),
        SensorDefinition::measurement("host_os", "Host OS", |ctx| {
            Ok(SensorValue::Text(ctx.facts.os_pretty_name()))
        })
        .icon("linux"),
        SensorDefinition::measurement("host_arch", "Host Architecture", |ctx| {
            Ok(SensorValue::text(ctx.facts.architecture()))
        })
        .icon("chip"),
        SensorDefinition::measurement("last_message", "Last Message", |ctx| {
            Ok(SensorValue::Text(ctx.facts.now()))
        })
        .device_class("timestamp")
        .icon("clock-check"),
        SensorDefinition::measurement("updates", "Updates", |ctx| {
            Ok(SensorValue::Integer(ctx.facts.pending_updates()? as i64))
        })
        .icon("cellphone-arrow-down"),
        SensorDefinition::measurement("wifi_strength", "Wifi Strength", |ctx| {
            Ok(SensorValue::Integer(ctx.facts.wifi_strength()))
        })
        .unit("dBm")
        .device_class("signal_strength")
        .icon("wifi"),
        SensorDefinition::measurement("wifi_ssid", "Wifi SSID", |ctx| {
            Ok(SensorValue::Text(ctx.facts.wifi_ssid()))
        })
        .device_class("signal_strength")
        .icon("wifi"),
    ]
}

fn load_sensor(id: &str, name: &str, index: usize) -> SensorDefinition {
    SensorDefinition::measurement(id, name, move |ctx| {
        Ok(SensorValue::fixed(ctx.facts.load_average()[index], 2))
    })
    .icon("cpu-64-bit")
}
