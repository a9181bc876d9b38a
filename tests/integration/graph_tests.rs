//! Graph wiring integration tests.
//!
//! Tests verify:
//! - Connecting is idempotent and rejects cycles
//! - Slots are ready once configured and dirty only after data changes
//! - Metadata changes reconfigure downstream operators
//! - Dirty regions travel through piper, elementwise and sub-region operators
//! - Dropping or cleaning up operators releases their subscriptions

use std::sync::Arc;

use parking_lot::Mutex;

use blockflow::{
    ArrayBuffer, DType, FlowError, Graph, MetadataError, OpArrayPiper, OpArraySource, OpElementwise,
    OpSubRegion, OutputSlot, Roi, SlotState,
};

use super::test_utils::{patterned_u16, roi};

fn record_dirty(slot: &OutputSlot) -> Arc<Mutex<Vec<Roi>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    slot.notify_dirty(move |roi| sink.lock().push(roi.clone()));
    seen
}

#[test]
fn test_connect_is_idempotent() {
    let source = OpArraySource::new(Some(patterned_u16(&[4, 4]))).unwrap();
    let piper = OpArrayPiper::new();
    piper.input().connect(source.output()).unwrap();
    piper.input().connect(source.output()).unwrap();
    assert_eq!(source.output().dirty_listener_count(), 1);
    assert!(piper.output().ready());
}

#[test]
fn test_cycle_is_rejected() {
    let source = OpArraySource::new(Some(patterned_u16(&[4, 4]))).unwrap();
    let first = OpArrayPiper::new();
    let second = OpArrayPiper::new();
    first.input().connect(source.output()).unwrap();
    second.input().connect(first.output()).unwrap();

    let err = first.input().connect(second.output()).unwrap_err();
    assert!(matches!(err, MetadataError::Cycle { .. }));
    // The failed connect leaves the existing wiring in place
    assert!(first.input().upstream().unwrap().ptr_eq(source.output()));
}

#[test]
fn test_slot_states_follow_configuration() {
    let source = OpArraySource::new(Some(patterned_u16(&[4, 4]))).unwrap();
    assert_eq!(source.output().state(), SlotState::Ready);

    let piper = OpArrayPiper::new();
    let scale = OpElementwise::scale(2.0);
    scale.input().connect(piper.output()).unwrap();
    assert_eq!(scale.output().state(), SlotState::NotReady);
    piper.input().connect(source.output()).unwrap();
    assert_eq!(piper.output().state(), SlotState::Ready);
    assert_eq!(scale.output().state(), SlotState::Ready);

    // New data marks everything downstream dirty
    let patch = ArrayBuffer::from_elements(&[1, 1], &[5u16]).unwrap();
    source.write_region(&roi(&[0, 0], &[1, 1]), &patch).unwrap();
    assert_eq!(piper.output().state(), SlotState::Dirty);
    assert_eq!(scale.output().state(), SlotState::Dirty);

    // New metadata is established by reconfiguring, which clears it
    source.set_array(ArrayBuffer::zeros(&[2, 8], DType::U16)).unwrap();
    assert_eq!(piper.output().state(), SlotState::Ready);
    assert_eq!(scale.output().state(), SlotState::Ready);
}

#[tokio::test]
async fn test_disconnect_makes_downstream_not_ready() {
    let source = OpArraySource::new(Some(patterned_u16(&[4, 4]))).unwrap();
    let piper = OpArrayPiper::new();
    let scale = OpElementwise::scale(2.0);
    piper.input().connect(source.output()).unwrap();
    scale.input().connect(piper.output()).unwrap();
    assert!(scale.output().ready());

    piper.input().disconnect().unwrap();
    assert!(!piper.output().ready());
    assert!(!scale.output().ready());
    assert_eq!(scale.output().state(), SlotState::NotReady);

    let err = scale.output().get_all().wait().await.unwrap_err();
    assert!(matches!(err, FlowError::NotReady { .. }));
}

#[tokio::test]
async fn test_metadata_change_reconfigures_downstream() {
    let source = OpArraySource::new(Some(patterned_u16(&[4, 4]))).unwrap();
    let scale = OpElementwise::scale(0.5);
    scale.input().connect(source.output()).unwrap();
    let seen = record_dirty(scale.output());

    source.set_array(ArrayBuffer::zeros(&[6, 3], DType::U16)).unwrap();
    assert_eq!(scale.output().meta().unwrap().shape, vec![6, 3]);
    let seen = seen.lock().clone();
    assert!(!seen.is_empty());
    assert!(seen.iter().all(|roi| *roi == Roi::from_shape(&[6, 3])));

    let data = scale.output().get_all().wait().await.unwrap();
    assert_eq!(data.shape(), &[6, 3]);
}

#[tokio::test]
async fn test_dirty_regions_are_translated_by_sub_region() {
    let source = OpArraySource::new(Some(patterned_u16(&[10, 10]))).unwrap();
    let piper = OpArrayPiper::new();
    let crop = OpSubRegion::new();
    piper.input().connect(source.output()).unwrap();
    crop.input().connect(piper.output()).unwrap();
    crop.region().set_value(roi(&[2, 3], &[8, 9])).unwrap();
    assert_eq!(crop.output().meta().unwrap().shape, vec![6, 6]);

    let piped = record_dirty(piper.output());
    let cropped = record_dirty(crop.output());

    let patch = ArrayBuffer::from_elements(&[2, 2], &[1u16, 2, 3, 4]).unwrap();
    source.write_region(&roi(&[1, 4], &[3, 6]), &patch).unwrap();
    assert_eq!(*piped.lock(), vec![roi(&[1, 4], &[3, 6])]);
    // Clipped to the crop, then shifted by its origin
    assert_eq!(*cropped.lock(), vec![roi(&[0, 1], &[1, 3])]);

    // Outside the crop: forwarded by the piper, swallowed by the crop
    let far = ArrayBuffer::from_elements(&[1, 1], &[9u16]).unwrap();
    source.write_region(&roi(&[9, 0], &[10, 1]), &far).unwrap();
    assert_eq!(piped.lock().len(), 2);
    assert_eq!(cropped.lock().len(), 1);

    let data = crop.output().get(roi(&[0, 1], &[1, 3])).wait().await.unwrap();
    assert_eq!(data.to_vec::<u16>().unwrap(), vec![3, 4]);
}

#[test]
fn test_dropping_operator_unsubscribes() {
    let source = OpArraySource::new(Some(patterned_u16(&[4, 4]))).unwrap();
    {
        let piper = OpArrayPiper::new();
        piper.input().connect(source.output()).unwrap();
        assert_eq!(source.output().dirty_listener_count(), 1);
    }
    assert_eq!(source.output().dirty_listener_count(), 0);
    // Emitting with nobody listening is harmless
    source.output().set_dirty_all();
}

#[test]
fn test_graph_clean_up_disconnects_in_reverse_order() {
    let mut graph = Graph::new();
    let source = graph.add(OpArraySource::new(Some(patterned_u16(&[4, 4]))).unwrap());
    let piper = graph.add(OpArrayPiper::new());
    let scale = graph.add(OpElementwise::scale(3.0));
    piper.input().connect(source.output()).unwrap();
    scale.input().connect(piper.output()).unwrap();
    assert_eq!(graph.len(), 3);

    graph.clean_up();
    assert!(graph.is_empty());
    assert!(!scale.input().is_connected());
    assert!(!piper.input().is_connected());
    assert_eq!(source.output().dirty_listener_count(), 0);
}
