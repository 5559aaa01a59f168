use std::net::{IpAddr, Ipv4Addr};

use crate::errors::ResolveError;
use crate::family::AddressFamily;
use crate::host::simulated::{Call, SimulatedHost, ip};
use crate::resolver::{Readiness, TunnelInterface, resolve_interface_address};

#[tokio::test]
async fn first_address_of_family() {
    let host = SimulatedHost::lan();
    host.set_addresses("tun0", &["fe80::1", "2001:db8::7", "10.8.0.2", "10.8.0.3"]);
    assert_eq!(resolve_interface_address(&host, "tun0", AddressFamily::V4).await.unwrap(), ip("10.8.0.2"));
    assert_eq!(resolve_interface_address(&host, "tun0", AddressFamily::V6).await.unwrap(), ip("fe80::1"));
}

#[tokio::test]
async fn mapped_address_is_returned_bare() {
    let host = SimulatedHost::lan();
    host.set_addresses("tun0", &["::ffff:10.8.0.2"]);
    let addr = resolve_interface_address(&host, "tun0", AddressFamily::V4).await.unwrap();
    assert_eq!(addr, IpAddr::V4(Ipv4Addr::new(10, 8, 0, 2)));
    assert!(matches!(
        resolve_interface_address(&host, "tun0", AddressFamily::V6).await,
        Err(ResolveError::NoMatchingAddress { address_count: 1, .. })
    ));
}

#[tokio::test]
async fn missing_interface() {
    let host = SimulatedHost::lan();
    let error = resolve_interface_address(&host, "tun9", AddressFamily::V4).await.unwrap_err();
    assert!(matches!(&error, ResolveError::InterfaceNotFound { interface } if interface == "tun9"));
    assert!(!error.is_retryable());
}

#[tokio::test]
async fn no_address_yet_is_retryable() {
    let host = SimulatedHost::lan();
    let error = resolve_interface_address(&host, "tun0", AddressFamily::V4).await.unwrap_err();
    assert!(matches!(&error, ResolveError::NoMatchingAddress { interface, family: AddressFamily::V4, address_count: 0 } if interface == "tun0"));
    assert!(error.is_retryable());
    assert!(error.to_string().contains("tun0"));
}

#[tokio::test]
async fn enumeration_failure() {
    let host = SimulatedHost::lan();
    host.fail(Call::InterfaceAddresses, libc::EPERM);
    let error = resolve_interface_address(&host, "tun0", AddressFamily::V4).await.unwrap_err();
    let ResolveError::AddressListFailed { interface, source } = &error else { panic!("unexpected error {error:?}") };
    assert_eq!(interface, "tun0");
    assert_eq!(source.raw_os_error(), Some(libc::EPERM));
    assert!(!error.is_retryable());
}

#[tokio::test]
async fn single_query_per_call() {
    let host = SimulatedHost::lan();
    let _ = resolve_interface_address(&host, "tun0", AddressFamily::V4).await;
    assert_eq!(host.address_queries("tun0"), 1);
}

#[test]
fn tunnel_interface_transitions() {
    let mut tunnel = TunnelInterface::new("tun0", AddressFamily::V4);
    assert!(tunnel.readiness.is_not_ready());
    tunnel.set_ready(ip("::ffff:10.8.0.2"));
    assert_eq!(tunnel.assigned_address, Some(ip("10.8.0.2")));
    assert_eq!(tunnel.readiness, Readiness::Ready);
    tunnel.set_failed();
    assert_eq!(tunnel.assigned_address, None);
    assert!(tunnel.readiness.is_failed());
}
