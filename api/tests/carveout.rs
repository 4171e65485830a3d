use std::sync::Arc;

use ion_api::ion::{
    CarveoutConfig, CarveoutHeap, CmaArea, CmaConfig, CmaHeap, HeapFlags, IonConfig, IonDevice,
    IonError, IonFlags, IonHeapType, PAGE_SIZE, Platform,
};

const KB: usize = 1024;

fn device() -> Arc<IonDevice> {
    IonDevice::new(IonConfig::default(), Platform::default()).unwrap()
}

#[test]
fn sixty_four_small_buffers_fill_the_heap() {
    let device = device();
    let id = device
        .register_heap(CarveoutHeap::new(CarveoutConfig::new("carveout", 0x9000_0000, 256 * KB)).unwrap())
        .unwrap();

    let handles: Vec<_> = (0..64)
        .map(|_| device.alloc(4 * KB, id.mask(), IonFlags::empty()).unwrap())
        .collect();
    assert_eq!(device.buffer_count(), 64);
    assert_eq!(
        device.alloc(4 * KB, id.mask(), IonFlags::empty()),
        Err(IonError::NoMemory)
    );

    device.release(handles[17]).unwrap();
    let again = device.alloc(4 * KB, id.mask(), IonFlags::empty()).unwrap();
    assert_eq!(again, handles[17]);

    let stats = device.heap(id).unwrap();
    assert_eq!(stats.stats().current(), 256 * KB);
    assert_eq!(stats.stats().peak(), 256 * KB);
    assert_eq!(stats.stats().total_allocated(), 65 * 4 * KB);
}

#[test]
fn untouchable_heap_requires_protection() {
    let device = device();
    let mut config = CarveoutConfig::new("secure_carveout", 0x9000_0000, 256 * KB);
    config.untouchable = true;
    config.secure = true;
    let id = device.register_heap(CarveoutHeap::new(config).unwrap()).unwrap();

    assert_eq!(
        device.alloc(4 * KB, id.mask(), IonFlags::empty()),
        Err(IonError::PermissionDenied)
    );
    assert_eq!(device.buffer_count(), 0);
    assert_eq!(device.heap(id).unwrap().stats().current(), 0);

    let handle = device.alloc(4 * KB, id.mask(), IonFlags::PROTECTED).unwrap();
    assert_eq!(device.mmap(handle).err(), Some(IonError::PermissionDenied));
    device.release(handle).unwrap();
}

#[test]
fn destroy_restores_the_free_ranges() {
    let device = device();
    let carveout = device
        .register_heap(CarveoutHeap::new(CarveoutConfig::new("carveout", 0x9000_0000, 256 * KB)).unwrap())
        .unwrap();
    let cma = device
        .register_heap(
            CmaHeap::new(CmaConfig::new("cma"), Box::new(CmaArea::new(0xa000_0000, 256 * KB)))
                .unwrap(),
        )
        .unwrap();

    for id in [carveout, cma] {
        let keep = device.alloc(8 * KB, id.mask(), IonFlags::empty()).unwrap();
        let before = device.free_gap_report(id).unwrap();
        let handle = device.alloc(16 * KB, id.mask(), IonFlags::empty()).unwrap();
        assert_ne!(device.free_gap_report(id).unwrap(), before);
        device.release(handle).unwrap();
        assert_eq!(device.free_gap_report(id).unwrap(), before);
        device.release(keep).unwrap();
    }
}

#[test]
fn heaps_are_listed_by_id() {
    let device = device();
    device
        .register_heap(CarveoutHeap::new(CarveoutConfig::new("carveout", 0x9000_0000, 256 * KB)).unwrap())
        .unwrap();
    device
        .register_heap(
            CmaHeap::new(CmaConfig::new("cma"), Box::new(CmaArea::new(0xa000_0000, 256 * KB)))
                .unwrap(),
        )
        .unwrap();

    let heaps = device.query_heaps();
    assert_eq!(heaps.len(), 2);
    assert_eq!(heaps[0].name, "carveout");
    assert_eq!(heaps[0].heap_type, IonHeapType::Carveout);
    assert_eq!(heaps[1].heap_type, IonHeapType::Cma);
    assert_eq!(heaps[1].size, 256 * KB);
    assert_eq!(heaps[1].flags, HeapFlags::empty());

    let cma = device.query("cma").unwrap();
    assert_eq!(cma.mask(), 1 << 1);
    // 两个堆都选中时优先使用后注册的 cma
    let handle = device
        .alloc(PAGE_SIZE, heaps[0].id.mask() | cma.mask(), IonFlags::empty())
        .unwrap();
    assert_eq!(device.buffer(handle).unwrap().heap_id, cma.id);
    device.release(handle).unwrap();
}
