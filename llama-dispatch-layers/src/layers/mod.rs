pub mod attention;

pub mod embedding;

pub mod feedforward;

pub mod layer_norm;

pub mod linear;

pub mod rotary;
