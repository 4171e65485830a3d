use std::sync::Arc;

use ion_api::ion::{
    CarveoutConfig, CarveoutHeap, IonConfig, IonDevice, IonError, IonEventType, IonFlags,
    PAGE_SIZE, Platform,
};

fn carveout(name: &str, base: usize, secure: bool) -> CarveoutHeap {
    let mut config = CarveoutConfig::new(name, base, 64 * PAGE_SIZE);
    config.secure = secure;
    CarveoutHeap::new(config).unwrap()
}

fn device() -> Arc<IonDevice> {
    IonDevice::new(IonConfig::default(), Platform::default()).unwrap()
}

#[test]
fn handles_hold_references() {
    let device = device();
    let id = device.register_heap(carveout("carveout", 0x9000_0000, false)).unwrap();

    let handle = device.allocate(PAGE_SIZE, id.mask(), IonFlags::CACHED).unwrap();
    let raw = handle.handle();
    let copy = handle.clone();
    assert_eq!(device.buffer(raw).unwrap().ref_count(), 2);

    drop(handle);
    assert_eq!(device.buffer(raw).unwrap().ref_count(), 1);
    assert_eq!(copy.phys_ranges().unwrap().len(), 1);

    drop(copy);
    assert_eq!(device.buffer(raw).err(), Some(IonError::InvalidArg));
    assert_eq!(device.heap(id).unwrap().stats().current(), 0);
}

#[test]
fn raw_handles_are_released_explicitly() {
    let device = device();
    let id = device.register_heap(carveout("carveout", 0x9000_0000, false)).unwrap();

    let raw = device
        .allocate(PAGE_SIZE, id.mask(), IonFlags::empty())
        .unwrap()
        .into_raw()
        .unwrap();
    assert_eq!(device.buffer_count(), 1);
    device.release(raw).unwrap();
    assert_eq!(device.buffer_count(), 0);
}

#[test]
fn camera_heap_is_remapped_when_protected() {
    let device = device();
    let camera = device.register_heap(carveout("camera", 0x9000_0000, false)).unwrap();
    let contig = device
        .register_heap(carveout("camera_contig", 0xa000_0000, true))
        .unwrap();
    device.add_remap(camera, true, contig).unwrap();

    let secure = device.allocate(PAGE_SIZE, camera.mask(), IonFlags::PROTECTED).unwrap();
    assert_eq!(secure.info().heap_id, contig);
    let plain = device.allocate(PAGE_SIZE, camera.mask(), IonFlags::empty()).unwrap();
    assert_eq!(plain.info().heap_id, camera);
}

#[test]
fn events_describe_buffer_activity() {
    let device = device();
    let id = device.register_heap(carveout("carveout", 0x9000_0000, false)).unwrap();

    let handle = device.allocate(2 * PAGE_SIZE, id.mask(), IonFlags::CACHED).unwrap();
    let raw = handle.handle();
    device.map_kernel(raw).unwrap();
    handle.phys_ranges().unwrap();
    drop(handle);

    let events = device.events().snapshot();
    let kinds: Vec<_> = events.iter().map(|event| event.event_type).collect();
    assert_eq!(
        kinds,
        [
            IonEventType::Alloc,
            IonEventType::Kmap,
            IonEventType::Mmap,
            IonEventType::Free
        ]
    );
    assert!(events.iter().all(|event| event.heap_name == "carveout"
        && event.buffer_id == raw
        && event.size == 2 * PAGE_SIZE));
    assert!(events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

#[test]
fn event_log_keeps_the_newest_entries() {
    let config = IonConfig {
        event_log_capacity: 4,
        ..IonConfig::default()
    };
    let device = IonDevice::new(config, Platform::default()).unwrap();
    let id = device.register_heap(carveout("carveout", 0x9000_0000, false)).unwrap();

    for _ in 0..5 {
        device.allocate(PAGE_SIZE, id.mask(), IonFlags::empty()).unwrap();
    }
    let events = device.events().snapshot();
    assert_eq!(events.len(), 4);
    assert_eq!(events[3].event_type, IonEventType::Free);
    assert_eq!(device.events().dropped(), 0);
}
