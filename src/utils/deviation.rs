use serde::{Deserialize, Serialize};

/// Exponentially decayed mean/variance over a scalar stream.
///
/// Each update discounts the accumulated weight, sum and sum of squares by
/// `1 - discount` before adding the new value, so recent values dominate.
/// A discount of 0 gives the plain running mean and population variance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Deviation {
    discount: f64,
    weight: f64,
    sum: f64,
    sum_squared: f64,
    count: u64,
}

impl Deviation {
    pub fn new(discount: f64) -> Self {
        Deviation {
            discount: discount.clamp(0.0, 1.0),
            weight: 0.0,
            sum: 0.0,
            sum_squared: 0.0,
            count: 0,
        }
    }

    /// Update with a new value
    pub fn update(&mut self, value: f64) {
        let factor = 1.0 - self.discount;
        self.weight = self.weight * factor + 1.0;
        self.sum = self.sum * factor + value;
        self.sum_squared = self.sum_squared * factor + value * value;
        self.count += 1;
    }

    pub fn mean(&self) -> f64 {
        if self.weight <= 0.0 {
            0.0
        } else {
            self.sum / self.weight
        }
    }

    pub fn variance(&self) -> f64 {
        if self.weight <= 0.0 {
            return 0.0;
        }
        let mean = self.mean();
        // cancellation can push this a hair below zero
        (self.sum_squared / self.weight - mean * mean).max(0.0)
    }

    /// Standard deviation
    pub fn deviation(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn discount(&self) -> f64 {
        self.discount
    }

    pub fn set_discount(&mut self, discount: f64) {
        self.discount = discount.clamp(0.0, 1.0);
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn reset(&mut self) {
        self.weight = 0.0;
        self.sum = 0.0;
        self.sum_squared = 0.0;
        self.count = 0;
    }
}
