//! Typed ID definitions for every record the synchronizer touches.
//!
//! Each ID type has a unique prefix that identifies the record kind.

use crate::define_id;

// =============================================================================
// Services and Service Instances
// =============================================================================

define_id!(ServiceId, "svc");
define_id!(ServiceInstanceId, "si");
define_id!(LinkId, "sil");

// =============================================================================
// Addressing
// =============================================================================

define_id!(AddressPoolId, "ap");

// =============================================================================
// Compute
// =============================================================================

define_id!(InstanceId, "inst");
define_id!(NodeId, "node");

// =============================================================================
// Tests
// =============================================================================
