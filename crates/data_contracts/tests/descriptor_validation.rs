use data_contracts::{CropRegions, DerivationStrategy, Rectangle, SampleDescriptor, ValidationError};

#[test]
fn degenerate_rectangle_rejected() {
    let rect = Rectangle::new((10, 5), (10, 20));
    let err = rect.validate().unwrap_err();
    assert!(matches!(err, ValidationError::DegenerateRectangle(_)));

    let inverted = Rectangle::new((10, 20), (20, 5));
    assert!(inverted.validate().is_err());
}

#[test]
fn out_of_bounds_is_not_clamped() {
    let rect = Rectangle::new((0, 0), (65, 10));
    let err = rect.check_bounds(64, 64).unwrap_err();
    assert_eq!(
        err,
        ValidationError::OutOfBounds {
            rect,
            width: 64,
            height: 64
        }
    );
    assert!(Rectangle::new((0, 0), (64, 64)).check_bounds(64, 64).is_ok());
}

#[test]
fn crop_descriptor_validates_both_regions() {
    let good = Rectangle::new((0, 0), (8, 8));
    let bad = Rectangle::new((8, 8), (8, 9));
    let descriptor = SampleDescriptor::cropped("frame.png", CropRegions::new(good, bad));
    assert!(descriptor.validate().is_err());

    let descriptor = SampleDescriptor::cropped("frame.png", CropRegions::new(good, good));
    assert!(descriptor.validate().is_ok());
}

#[test]
fn descriptor_serializes_tagged_strategy() {
    let descriptor = SampleDescriptor::cropped(
        "frame.png",
        CropRegions::new(Rectangle::new((0, 0), (2, 2)), Rectangle::new((2, 0), (4, 2))),
    )
    .with_comment_tag(Some(2));
    let json = serde_json::to_value(&descriptor).unwrap();
    assert_eq!(json["strategy"]["kind"], "crop");
    let back: SampleDescriptor = serde_json::from_value(json).unwrap();
    assert_eq!(back, descriptor);
    assert!(matches!(back.strategy, DerivationStrategy::Crop(_)));
}
